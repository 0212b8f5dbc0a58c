//! # dm-storage-engine 使用案例
//!
//! 1. 建立上下文与 SegmentStore（DMFile 落到本地目录）
//! 2. 写入、MVCC 读
//! 3. delete range
//! 4. merge_delta / split / merge，每一步都核对划分
//! 5. 带 rough set 过滤的读与扫描统计
//! 6. 从 meta 存储恢复

use std::sync::Arc;

use dm_storage_engine::{
    block::{Block, Row},
    field_type::{ColumnDefine, FieldType, Value},
    io::{FileIo, LocalFileProvider},
    storage_pool::{StoragePool, FIRST_SEGMENT_ID},
    DMContext, DmConfig, RSOperator, RowKeyRange, RowKeyValue, SegmentStore, SplitMode,
};

fn rows(handles: std::ops::Range<i64>, version: u64) -> Block {
    Block::new(
        handles
            .map(|h| Row::new_int(h, version, vec![Value::Int64(h * 100), Value::Bytes(format!("user-{h}").into_bytes())]))
            .collect(),
    )
}

fn count(store: &SegmentStore, start_ts: u64) -> dm_storage_engine::Result<usize> {
    let ctx = store.context().for_query("demo-read");
    let blocks = store.read(&ctx, &[ctx.full_range()], None, start_ts, 1024)?;
    Ok(blocks.iter().map(Block::rows).sum())
}

fn main() -> dm_storage_engine::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    println!("═══════════════════════════════════════════════════════════");
    println!("   dm-storage-engine 演示                                  ");
    println!("═══════════════════════════════════════════════════════════\n");

    // =========================================================================
    // 1. 上下文与 store
    // =========================================================================
    println!("【1】创建 SegmentStore ...");
    let dir = std::env::temp_dir().join("dm-storage-demo");
    let io = FileIo::new(Arc::new(LocalFileProvider::new(&dir)?));
    let columns = vec![
        ColumnDefine::new(1, "amount", FieldType::Int64),
        ColumnDefine::new(2, "user",   FieldType::Bytes),
    ];
    let config = DmConfig::default().with_pack_rows(128);
    let ctx = DMContext::new(config, Arc::new(StoragePool::in_memory()), io, columns, false)?
        .with_tracing_id("demo");
    let store = SegmentStore::create(ctx)?;
    println!("    dir = {}, segments = {}\n", dir.display(), store.segment_count());

    // =========================================================================
    // 2. 写入与 MVCC 读
    // =========================================================================
    println!("【2】写入 0..1000 @v1，再覆盖 200..300 @v5 ...");
    store.write(rows(0..1000, 1))?;
    store.write(rows(200..300, 5))?;
    println!("    ts=3 可见 {} 行, ts=10 可见 {} 行\n", count(&store, 3)?, count(&store, 10)?);

    // =========================================================================
    // 3. delete range
    // =========================================================================
    println!("【3】删除 [900, 1000) ...");
    store.delete_range(&RowKeyRange::from_handle_range(900, 1000, false))?;
    println!("    剩余 {} 行\n", count(&store, 10)?);

    // =========================================================================
    // 4. 结构变更
    // =========================================================================
    println!("【4】merge_delta → split → merge ...");
    store.segment_merge_delta(FIRST_SEGMENT_ID)?;
    let (left, right) = store
        .segment_split(FIRST_SEGMENT_ID, None, SplitMode::Physical)?
        .ok_or_else(|| dm_storage_engine::DmError::InvariantViolation("split refused".into()))?;
    for seg in store.segments() {
        println!("    segment {:>2} {:<20} rows≈{}", seg.segment_id(), seg.range().to_debug_string(), seg.estimated_rows());
    }
    store.segment_split(right, Some(RowKeyValue::from_int_handle(800)), SplitMode::Logical)?;
    println!("    split 后 {} 个 segment", store.segment_count());
    let ids: Vec<u64> = store.segments().iter().map(|s| s.segment_id()).collect();
    store.segment_merge(&ids)?;
    store.check_partition()?;
    println!("    merge 回 {} 个 segment（left = {left}），行数 {}\n", store.segment_count(), count(&store, 10)?);

    // =========================================================================
    // 5. rough set 过滤
    // =========================================================================
    println!("【5】amount > 50000 的 pack 过滤 ...");
    store.segment_merge_delta(FIRST_SEGMENT_ID)?;
    let qctx = store.context().for_query("demo-filter");
    let op = RSOperator::greater(1, Value::Int64(50_000));
    let blocks = store.read(&qctx, &[qctx.full_range()], Some(&op), 10, 1024)?;
    println!("    输出 {} 行", blocks.iter().map(Block::rows).sum::<usize>());
    println!("    scan = {}\n", qctx.scan_context);

    // =========================================================================
    // 6. 恢复
    // =========================================================================
    println!("【6】从 meta 恢复 ...");
    let restored = SegmentStore::restore(store.context().for_query("demo-restore"))?;
    println!("    恢复 {} 个 segment，可见 {} 行", restored.segment_count(), count(&restored, 10)?);

    println!("\n✓ 演示完成");
    Ok(())
}
