mod common;

use std::sync::Arc;

use dm_storage_engine::compression::CompressionMethod;
use dm_storage_engine::dmfile::{DMFile, DMFileWriter};
use dm_storage_engine::field_type::Value;
use dm_storage_engine::segment::NO_NEXT_SEGMENT;
use dm_storage_engine::storage_pool::FIRST_SEGMENT_ID;
use dm_storage_engine::{DmConfig, DmError, RSOperator, RowKeyRange, RowKeyValue, Segment, SegmentState, SplitMode};

use common::{block, context, handles, raw_rows, read_at, store};

fn key(v: i64) -> Option<RowKeyValue> {
    Some(RowKeyValue::from_int_handle(v))
}

/// 切出 [10, 20)，写入 10..20 并合入 stable，再在 delta 中覆盖 12..18
fn store_with_middle_segment(mode_config: DmConfig) -> (dm_storage_engine::SegmentStore, u64) {
    let store = store(mode_config.with_pack_rows(4));
    let (_, mid) = store.segment_split(FIRST_SEGMENT_ID, key(10), SplitMode::Physical).unwrap().unwrap();
    let (mid, _) = store.segment_split(mid, key(20), SplitMode::Physical).unwrap().unwrap();
    store.write(block(10..20, 1)).unwrap();
    assert!(store.segment_merge_delta(mid).unwrap());
    store.write(block(12..18, 2)).unwrap();
    (store, mid)
}

#[test]
fn split_middle_segment_at_16() {
    for mode in [SplitMode::Physical, SplitMode::Logical] {
        let (store, mid) = store_with_middle_segment(DmConfig::default());
        let before = raw_rows(&store);
        assert_eq!(before, 16);

        let (l, r) = store.segment_split(mid, key(16), mode).unwrap().unwrap();
        assert_eq!(l, mid);
        let left  = store.get_segment(l).unwrap();
        let right = store.get_segment(r).unwrap();
        assert_eq!(left.range(), &RowKeyRange::from_handle_range(10, 16, false));
        assert_eq!(right.range(), &RowKeyRange::from_handle_range(16, 20, false));
        assert_eq!(left.next_segment_id(), r);

        assert_eq!(raw_rows(&store), before);
        assert_eq!(read_at(&store, 5), (10..20).collect::<Vec<_>>());
        store.check_partition().unwrap();
    }
}

#[test]
fn logical_split_shares_stable_files() {
    let (store, mid) = store_with_middle_segment(DmConfig::default());
    let file_id = store.get_segment(mid).unwrap().stable().files()[0].id();

    let (l, r) = store.segment_split(mid, key(16), SplitMode::Logical).unwrap().unwrap();
    let left  = store.get_segment(l).unwrap();
    let right = store.get_segment(r).unwrap();
    assert_eq!(left.stable().files()[0].id(), file_id);
    assert_eq!(right.stable().files()[0].id(), file_id);
    assert_eq!(left.stable().valid_rows(), 6);
    assert_eq!(right.stable().valid_rows(), 4);

    // delta 中 12..18 按区间拆开
    let ctx = store.context().for_query("halves");
    let raw = |seg: &Segment| {
        let snap = seg.read_snapshot();
        let blocks = seg.get_input_stream_mode_raw(&ctx, &snap, &[ctx.full_range()], 64).unwrap();
        blocks.iter().map(|b| b.rows()).sum::<usize>()
    };
    assert_eq!(raw(&left), 6 + 4);
    assert_eq!(raw(&right), 4 + 2);
}

#[test]
fn auto_split_follows_config() {
    let (store, mid) = store_with_middle_segment(DmConfig::default().with_logical_split(true));
    let file_id = store.get_segment(mid).unwrap().stable().files()[0].id();
    let (l, _) = store.segment_split(mid, None, SplitMode::Auto).unwrap().unwrap();
    assert_eq!(store.get_segment(l).unwrap().stable().files()[0].id(), file_id);
}

#[test]
fn retired_segment_keeps_serving_old_snapshot() {
    let store = store(DmConfig::default().with_pack_rows(4));
    store.write(block(0..10, 1)).unwrap();
    let old = store.get_segment(FIRST_SEGMENT_ID).unwrap();
    let snap = old.read_snapshot();

    assert!(store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());
    assert_eq!(old.state(), SegmentState::Retired);
    store.write(block(10..12, 2)).unwrap();

    let ctx = store.context().for_query("old");
    let rows = old.get_input_stream_mode_normal(&ctx, &snap, &[ctx.full_range()], None, 9, 64).unwrap();
    assert_eq!(handles(&rows), (0..10).collect::<Vec<_>>());
    assert_eq!(read_at(&store, 9), (0..12).collect::<Vec<_>>());
}

#[test]
fn delete_range_survives_merge_delta() {
    let store = store(DmConfig::default().with_pack_rows(4));
    store.write(block(0..10, 1)).unwrap();
    store.delete_range(&RowKeyRange::from_handle_range(2, 6, false)).unwrap();
    // delete range 之后写入的行不受影响
    store.write(block(3..4, 2)).unwrap();
    let expect = vec![0, 1, 3, 6, 7, 8, 9];
    assert_eq!(read_at(&store, 9), expect);

    assert!(store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());
    assert_eq!(read_at(&store, 9), expect);
    assert_eq!(raw_rows(&store), expect.len());
}

#[test]
fn merge_back_restores_single_segment() {
    let (store, mid) = store_with_middle_segment(DmConfig::default());
    let ids: Vec<u64> = store.segments().iter().map(|s| s.segment_id()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[1], mid);

    let merged = store.segment_merge(&ids).unwrap().unwrap();
    assert_eq!(merged, FIRST_SEGMENT_ID);
    let seg = store.get_segment(merged).unwrap();
    assert!(seg.range().all());
    assert_eq!(seg.next_segment_id(), NO_NEXT_SEGMENT);
    assert_eq!(raw_rows(&store), 16);
    assert_eq!(read_at(&store, 1), (10..20).collect::<Vec<_>>());
}

#[test]
fn write_outside_segment_range_is_rejected() {
    let ctx = context(DmConfig::default());
    let seg = Segment::new_segment(&ctx, RowKeyRange::from_handle_range(10, 20, false), 7, NO_NEXT_SEGMENT).unwrap();
    let err = seg.write(&ctx, block([25], 1)).unwrap_err();
    assert!(matches!(err, DmError::InvariantViolation(_)));
    assert!(seg.write(&ctx, block([15], 1)).unwrap());
}

#[test]
fn concurrent_writes_during_splits() {
    let store = Arc::new(store(DmConfig::default().with_pack_rows(16)));
    std::thread::scope(|s| {
        let writer = store.clone();
        s.spawn(move || {
            for chunk in 0..40 {
                writer.write(block(chunk * 50..(chunk + 1) * 50, 1)).unwrap();
            }
        });
        for _ in 0..8 {
            let ids: Vec<u64> = store.segments().iter().map(|s| s.segment_id()).collect();
            for id in ids {
                let _ = store.segment_split(id, None, SplitMode::Auto).unwrap();
            }
            std::thread::yield_now();
        }
    });
    store.check_partition().unwrap();
    assert_eq!(read_at(&store, 1), (0..2000).collect::<Vec<_>>());
}

#[test]
fn replaced_meta_version_retires_the_old_object() {
    let store = store(DmConfig::default().with_pack_rows(4));
    store.write(block(0..20, 1)).unwrap();
    assert!(store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());
    store.write(block(20..22, 2)).unwrap();

    let stale = store.get_segment(FIRST_SEGMENT_ID).unwrap();
    let bumped: Vec<Arc<DMFile>> = stale.stable().files().iter()
        .map(|f| Arc::new(f.with_meta_version(7)))
        .collect();
    assert!(store.segment_replace_stable_meta_version(FIRST_SEGMENT_ID, &bumped).unwrap());

    // 旧对象不再接受结构变更，也不会拖累映射中的新对象
    assert_eq!(stale.state(), SegmentState::Retired);
    let ctx = store.context().for_query("stale");
    assert!(stale.split(&ctx, key(10), SplitMode::Logical).unwrap().is_none());
    assert!(stale.merge_delta(&ctx).unwrap().is_none());

    let current = store.get_segment(FIRST_SEGMENT_ID).unwrap();
    assert_eq!(current.state(), SegmentState::Active);
    assert_eq!(current.stable().files()[0].meta_version(), 7);
    store.write(block(22..24, 3)).unwrap();
    assert_eq!(read_at(&store, 9), (0..24).collect::<Vec<_>>());

    let (l, r) = store.segment_split(FIRST_SEGMENT_ID, key(10), SplitMode::Logical).unwrap().unwrap();
    assert_eq!(store.get_segment(l).unwrap().stable().files()[0].meta_version(), 7);
    assert_eq!(store.get_segment(r).unwrap().stable().files()[0].meta_version(), 7);
    assert_eq!(raw_rows(&store), 24);
    store.check_partition().unwrap();
}

#[test]
fn for_update_snapshot_guards_replace_data() {
    let store = store(DmConfig::default().with_pack_rows(4));
    store.write(block(0..8, 1)).unwrap();
    let snap = store.create_snapshot(FIRST_SEGMENT_ID, true).unwrap().unwrap();
    assert!(snap.delta.is_for_update());
    assert!(store.create_snapshot(FIRST_SEGMENT_ID, true).unwrap().is_none());
    assert!(!store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());
    assert!(!store.segment_flush_cache(FIRST_SEGMENT_ID).unwrap());
    store.write(block(8..10, 2)).unwrap();

    // 把快照中的数据重写为一个新文件
    let ctx = store.context().for_query("rewrite");
    let seg = store.get_segment(FIRST_SEGMENT_ID).unwrap();
    let rows = seg.get_input_stream_mode_raw(&ctx, &snap, &[ctx.full_range()], 64).unwrap();
    let mut w = DMFileWriter::new(
        ctx.storage_pool.new_dmfile_id(), &ctx.config.dmfile_dir, &ctx.columns, false, 4, CompressionMethod::Lz4,
    );
    for b in &rows {
        w.write(b).unwrap();
    }
    let file = w.finalize(&ctx.io).unwrap();

    assert!(store.segment_replace_data(FIRST_SEGMENT_ID, file.clone(), Some(&snap)).unwrap());
    assert_eq!(read_at(&store, 9), (0..10).collect::<Vec<_>>());
    assert_eq!(seg.state(), SegmentState::Retired);
    // 同一快照不能再用于新对象
    assert!(!store.segment_replace_data(FIRST_SEGMENT_ID, file, Some(&snap)).unwrap());
    assert!(store.create_snapshot(FIRST_SEGMENT_ID, true).unwrap().is_some());
}

#[test]
fn superseded_stable_files_are_collected() {
    let store = store(DmConfig::default().with_pack_rows(4));
    store.write(block(0..10, 1)).unwrap();
    assert!(store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());
    let ctx = store.context().for_query("gc");
    let (first_id, first_path) = {
        let seg = store.get_segment(FIRST_SEGMENT_ID).unwrap();
        let f = &seg.stable().files()[0];
        (f.id(), f.path().to_string())
    };

    // 过滤读把第一个文件的索引放进缓存
    let op = RSOperator::greater(1, Value::Int64(3));
    store.read(&ctx, &[ctx.full_range()], Some(&op), 9, 64).unwrap();
    let cache = ctx.index_cache.clone().unwrap();
    assert!(cache.get(&(first_id, 1)).is_some());

    // 被取代的 segment 上仍有读快照时推迟删除
    let old = store.get_segment(FIRST_SEGMENT_ID).unwrap();
    let snap = old.read_snapshot();
    store.write(block(10..20, 2)).unwrap();
    assert!(store.segment_merge_delta(FIRST_SEGMENT_ID).unwrap());
    assert_eq!(ctx.file_gc.refs(first_id), 0);
    assert_eq!(store.gc_dmfiles(), 0);
    assert!(ctx.io.provider.size(&first_path).is_ok());

    drop(snap);
    drop(old);
    assert_eq!(store.gc_dmfiles(), 1);
    assert!(ctx.io.provider.size(&first_path).is_err());
    assert!(cache.get(&(first_id, 1)).is_none());
    assert_eq!(read_at(&store, 9), (0..20).collect::<Vec<_>>());
}

#[test]
fn shared_stable_file_survives_until_both_halves_go() {
    let (store, mid) = store_with_middle_segment(DmConfig::default());
    let file_id = store.get_segment(mid).unwrap().stable().files()[0].id();
    let (l, r) = store.segment_split(mid, key(16), SplitMode::Logical).unwrap().unwrap();
    let gc = store.context().file_gc.clone();
    assert_eq!(gc.refs(file_id), 2);

    assert!(store.segment_merge_delta(l).unwrap());
    assert_eq!(gc.refs(file_id), 1);
    assert_eq!(store.gc_dmfiles(), 0);
    assert_eq!(read_at(&store, 5), (10..20).collect::<Vec<_>>());

    assert!(store.segment_merge_delta(r).unwrap());
    assert_eq!(gc.refs(file_id), 0);
    assert_eq!(store.gc_dmfiles(), 1);
    assert_eq!(read_at(&store, 5), (10..20).collect::<Vec<_>>());
}
