use std::cmp::Ordering;

use proptest::prelude::*;

use dm_storage_engine::rowkey::{codec_flag, encode_int64, merge_ranges, shrink_ranges};
use dm_storage_engine::{RowKeyRange, RowKeyValue};

fn int_range() -> impl Strategy<Value = RowKeyRange> {
    (any::<i64>(), any::<i64>()).prop_map(|(a, b)| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        RowKeyRange::from_handle_range(lo, hi, false)
    })
}

proptest! {
    #[test]
    fn int_order_matches_encoding(a in any::<i64>(), b in any::<i64>()) {
        let (ka, kb) = (RowKeyValue::from_int_handle(a), RowKeyValue::from_int_handle(b));
        prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        prop_assert_eq!(encode_int64(a).cmp(&encode_int64(b)), a.cmp(&b));
    }

    #[test]
    fn common_order_is_bytewise(a in prop::collection::vec(any::<u8>(), 0..12),
                                b in prop::collection::vec(any::<u8>(), 0..12)) {
        let (ka, kb) = (RowKeyValue::from_common_handle(&a), RowKeyValue::from_common_handle(&b));
        prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
    }

    #[test]
    fn to_next_is_tight(v in any::<i64>()) {
        let k = RowKeyValue::from_int_handle(v);
        let next = k.to_next();
        prop_assert!(next > k);
        if v < i64::MAX {
            prop_assert_eq!(next, RowKeyValue::from_int_handle(v + 1));
        } else {
            prop_assert_eq!(&next, RowKeyValue::int_handle_max());
        }
    }

    #[test]
    fn common_to_next_has_nothing_between(a in prop::collection::vec(any::<u8>(), 0..8), tail in any::<u8>()) {
        let k = RowKeyValue::from_common_handle(&a);
        let next = k.to_next();
        let mut longer = a.clone();
        longer.push(tail);
        let longer_key = RowKeyValue::from_common_handle(&longer);
        // 以 k 为前缀的更长键都不小于 next
        prop_assert!(longer_key >= next);
        prop_assert!(next > k);
    }

    #[test]
    fn shrink_is_intersection(a in int_range(), b in int_range(), h in any::<i64>()) {
        let key = RowKeyValue::from_int_handle(h);
        let s = a.shrink(&b);
        prop_assert_eq!(s.check(&key), a.check(&key) && b.check(&key));
        prop_assert_eq!(!s.none(), !a.none() && !b.none() && a.intersect(&b));
    }

    #[test]
    fn merge_covers_both(a in int_range(), b in int_range()) {
        let m = a.merge(&b);
        if !a.none() { prop_assert!(m.check_range_included(&a)); }
        if !b.none() { prop_assert!(m.check_range_included(&b)); }
        prop_assert_eq!(merge_ranges(&[a.clone(), b.clone()], false, 1), m);
    }

    #[test]
    fn shrink_ranges_drops_empty(target in int_range(), reads in prop::collection::vec(int_range(), 0..6)) {
        let out = shrink_ranges(&target, &reads);
        prop_assert!(out.iter().all(|r| !r.none() && target.check_range_included(r)));
        let live = |r: &RowKeyRange| !r.none() && !target.none() && r.intersect(&target);
        prop_assert_eq!(out.len(), reads.iter().filter(|r| live(r)).count());
    }

    #[test]
    fn serialize_round_trip(r in int_range()) {
        let back = RowKeyRange::deserialize(&r.serialize()).unwrap();
        prop_assert_eq!(&back, &r);
        prop_assert_eq!(back.start.int_value(), r.start.int_value());
        prop_assert_eq!(back.end.int_value(), r.end.int_value());
    }

    #[test]
    fn pos_range_matches_filter(hs in prop::collection::vec(-100i64..100, 0..40), r in (-120i64..120, -120i64..120)) {
        let mut hs = hs;
        hs.sort();
        let keys: Vec<RowKeyValue> = hs.iter().map(|&h| RowKeyValue::from_int_handle(h)).collect();
        let (lo, hi) = if r.0 <= r.1 { r } else { (r.1, r.0) };
        let range = RowKeyRange::from_handle_range(lo, hi, false);
        let (offset, limit) = range.get_pos_range(&keys, 0, keys.len());
        let expect: Vec<usize> = (0..keys.len()).filter(|&i| range.check(&keys[i])).collect();
        prop_assert_eq!((offset..offset + limit).collect::<Vec<_>>(), expect);
    }
}

#[test]
fn int_max_sentinel_is_above_every_handle() {
    let max = RowKeyValue::int_handle_max();
    assert_eq!(RowKeyValue::from_int_handle(i64::MAX).cmp(max), Ordering::Less);
    assert!(RowKeyRange::from_handle_range(0, i64::MAX, false).check(&RowKeyValue::from_int_handle(i64::MAX)));
    assert!(RowKeyRange::from_handle_range_inclusive(5, i64::MAX).is_end_infinite());
}

#[test]
fn legacy_common_sentinels_decode_to_infinity() {
    // 两列主键，旧版本用每列一个标志字节表示开区间
    let legacy = RowKeyRange::new(
        RowKeyValue::from_common_handle(&[codec_flag::BYTES, codec_flag::NIL]),
        RowKeyValue::from_common_handle(&[codec_flag::MAX, codec_flag::MAX]),
        true,
        2,
    );
    let back = RowKeyRange::deserialize(&legacy.serialize()).unwrap();
    assert!(back.all());
    assert_eq!(&back.start, RowKeyValue::common_handle_min());
    assert_eq!(&back.end, RowKeyValue::common_handle_max());

    // 列数不匹配时按普通键处理
    let short = RowKeyRange::new(
        RowKeyValue::from_common_handle(&[codec_flag::BYTES]),
        RowKeyValue::from_common_handle(&[codec_flag::MAX, codec_flag::MAX]),
        true,
        3,
    );
    let back = RowKeyRange::deserialize(&short.serialize()).unwrap();
    assert!(!back.is_end_infinite());
}

#[test]
fn region_range_prefixes_table_and_keyspace() {
    let r = RowKeyRange::from_handle_range(1, 2, false);
    let (start, end) = r.to_region_range(None, 7);
    assert_eq!(start[0], b't');
    assert!(start < end);
    let (ks_start, _) = r.to_region_range(Some(3), 7);
    assert_eq!(&ks_start[..4], &[b'x', 0, 0, 3]);
}

#[test]
#[should_panic]
fn cross_encoding_compare_panics() {
    let _ = RowKeyValue::from_int_handle(1).cmp(&RowKeyValue::from_common_handle(&[1]));
}
