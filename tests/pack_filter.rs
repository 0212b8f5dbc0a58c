mod common;

use std::sync::Arc;

use proptest::prelude::*;

use dm_storage_engine::block::{Block, Row};
use dm_storage_engine::compression::CompressionMethod;
use dm_storage_engine::dmfile::{DMFile, DMFileWriter};
use dm_storage_engine::field_type::Value;
use dm_storage_engine::pack_filter::DMFilePackFilter;
use dm_storage_engine::scan_context::ScanContext;
use dm_storage_engine::storage_pool::FIRST_SEGMENT_ID;
use dm_storage_engine::{DMContext, DmConfig, RSOperator, RSResult, RowKeyRange};

use common::{block, context, handles, store};

fn write_file(ctx: &DMContext, values: &[i64], pack_rows: usize) -> Arc<DMFile> {
    let rows: Vec<Row> = values.iter().enumerate()
        .map(|(h, &v)| Row::new_int(h as i64, 1, vec![Value::Int64(v)]))
        .collect();
    let mut w = DMFileWriter::new(1, "dmf", &ctx.columns, false, pack_rows, CompressionMethod::Lz4);
    w.write(&Block::new(rows)).unwrap();
    w.finalize(&ctx.io).unwrap()
}

#[test]
fn min_10_max_20_pack() {
    let ctx = context(DmConfig::default());
    let file = write_file(&ctx, &(10..=20).collect::<Vec<_>>(), 64);
    let ranges = [RowKeyRange::new_all(false, 1)];
    let check = |op: RSOperator| {
        DMFilePackFilter::load_from(&ctx, &file, true, &ranges, Some(&op), None).unwrap().pack_res[0]
    };
    assert_eq!(check(RSOperator::greater(1, Value::Int64(25))), RSResult::None);
    assert_eq!(check(RSOperator::greater(1, Value::Int64(5))), RSResult::All);
    assert_eq!(check(RSOperator::greater(1, Value::Int64(15))), RSResult::Some);
    assert_eq!(check(RSOperator::Not(Box::new(RSOperator::greater(1, Value::Int64(25))))), RSResult::All);
    assert_eq!(check(RSOperator::Unsupported("udf".into())), RSResult::Some);
}

#[test]
fn store_read_skips_filtered_packs() {
    let store = store(DmConfig::default().with_pack_rows(64));
    store.write(block(10..=20, 1)).unwrap();
    assert!(store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());

    let read = |op: RSOperator| {
        let ctx = store.context().for_query("filter");
        let rows = handles(&store.read(&ctx, &[ctx.full_range()], Some(&op), 5, 64).unwrap());
        (rows, ctx)
    };

    let (rows, ctx) = read(RSOperator::greater(1, Value::Int64(25)));
    assert!(rows.is_empty());
    assert_eq!(ScanContext::get(&ctx.scan_context.rs_pack_filter_none), 1);
    assert_eq!(ScanContext::get(&ctx.scan_context.dmfile_data_skipped_rows), 11);

    let (rows, ctx) = read(RSOperator::greater(1, Value::Int64(5)));
    assert_eq!(rows, (10..=20).collect::<Vec<_>>());
    assert_eq!(ScanContext::get(&ctx.scan_context.rs_pack_filter_all), 1);
    // 干净的 pack 整段输出，不进 MVCC
    assert_eq!(ScanContext::get(&ctx.scan_context.dmfile_mvcc_skipped_rows), 11);

    // rough set 只做 pack 级裁剪，Some 的 pack 原样输出
    let (rows, _) = read(RSOperator::greater(1, Value::Int64(15)));
    assert_eq!(rows.len(), 11);
}

#[test]
fn filter_disabled_reads_everything() {
    let store = store(DmConfig::default().with_pack_rows(64).with_rough_set_filter(false));
    store.write(block(10..=20, 1)).unwrap();
    assert!(store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());
    let ctx = store.context().for_query("no-filter");
    let op = RSOperator::greater(1, Value::Int64(25));
    let rows = store.read(&ctx, &[ctx.full_range()], Some(&op), 5, 64).unwrap();
    assert_eq!(handles(&rows).len(), 11);
}

fn compare_op() -> impl Strategy<Value = (usize, i64)> {
    (0usize..6, -50i64..50)
}

fn build(kind: usize, v: i64) -> (RSOperator, Box<dyn Fn(i64) -> bool>) {
    let value = Value::Int64(v);
    let op = match kind {
        0 => RSOperator::equal(1, value),
        1 => RSOperator::not_equal(1, value),
        2 => RSOperator::greater(1, value),
        3 => RSOperator::greater_equal(1, value),
        4 => RSOperator::less(1, value),
        _ => RSOperator::less_equal(1, value),
    };
    let pred: Box<dyn Fn(i64) -> bool> = match kind {
        0 => Box::new(move |x: i64| x == v),
        1 => Box::new(move |x: i64| x != v),
        2 => Box::new(move |x: i64| x > v),
        3 => Box::new(move |x: i64| x >= v),
        4 => Box::new(move |x: i64| x < v),
        _ => Box::new(move |x: i64| x <= v),
    };
    (op, pred)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// None 的 pack 中没有满足谓词的行，All 的 pack 中所有行都满足
    #[test]
    fn rough_check_is_sound(values in prop::collection::vec(-40i64..40, 1..40), (kind, v) in compare_op()) {
        let ctx = context(DmConfig::default());
        let file = write_file(&ctx, &values, 4);
        let (op, pred) = build(kind, v);
        let res = DMFilePackFilter::load_from(
            &ctx, &file, false, &[RowKeyRange::new_all(false, 1)], Some(&op), None,
        ).unwrap();

        for (pack_id, chunk) in values.chunks(4).enumerate() {
            let matched = chunk.iter().filter(|&&x| pred(x)).count();
            match res.pack_res[pack_id] {
                RSResult::None => prop_assert_eq!(matched, 0),
                RSResult::All  => prop_assert_eq!(matched, chunk.len()),
                _ => {}
            }
        }
    }
}
