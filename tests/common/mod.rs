#![allow(dead_code)]

use std::sync::Once;

use dm_storage_engine::block::{Block, Row};
use dm_storage_engine::field_type::{ColumnDefine, FieldType, Value};
use dm_storage_engine::{DMContext, DmConfig, SegmentStore};

static TRACING: Once = Once::new();

/// 测试输出里带上引擎日志，便于定位失败
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub fn columns() -> Vec<ColumnDefine> {
    vec![ColumnDefine::new(1, "v", FieldType::Int64)]
}

pub fn context(config: DmConfig) -> DMContext {
    init_tracing();
    DMContext::in_memory(config, columns(), false).unwrap().with_tracing_id("it")
}

pub fn store(config: DmConfig) -> SegmentStore {
    SegmentStore::create(context(config)).unwrap()
}

/// v = handle
pub fn block(handles: impl IntoIterator<Item = i64>, version: u64) -> Block {
    Block::new(
        handles.into_iter()
            .map(|h| Row::new_int(h, version, vec![Value::Int64(h)]))
            .collect(),
    )
}

pub fn handles(blocks: &[Block]) -> Vec<i64> {
    blocks.iter().flat_map(|b| b.rows.iter().map(|r| r.handle.int_value())).collect()
}

pub fn read_at(store: &SegmentStore, ts: u64) -> Vec<i64> {
    let ctx = store.context().for_query("read");
    handles(&store.read(&ctx, &[ctx.full_range()], None, ts, 64).unwrap())
}

pub fn raw_rows(store: &SegmentStore) -> usize {
    let ctx = store.context().for_query("raw");
    store.read_raw(&ctx, &[ctx.full_range()], 64).unwrap().iter().map(Block::rows).sum()
}
