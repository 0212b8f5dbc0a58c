//! DMFile pack 过滤
//!
//! 对 stable 文件的每个 pack 给出两类判定：
//! - `handle_res` — 只看 rowkey 区间（与可选的 pack 白名单）
//! - `pack_res`   — `handle_res AND filter_res`，filter_res 来自下推谓词的 rough check
//!
//! 之后 `get_skipped_range_and_filter*` 找出对给定 MVCC 快照完全干净的 pack，
//! 它们整段输出，不参与 MVCC。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::common::{ColId, Result, Timestamp};
use crate::dm_context::DMContext;
use crate::dmfile::DMFile;
use crate::field_type::{FieldType, Value};
use crate::filter::{RSCheckParam, RSOperator, RSResult};
use crate::index::MinMaxIndex;
use crate::rowkey::{RowKeyRange, RowKeyValue};
use crate::scan_context::ScanContext;

/// 过滤后仍需读取的 pack / 行 / 字节数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MatchDetail {
    pub packs: usize,
    pub rows:  usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DMFilePackFilterResult {
    pub handle_res: Vec<RSResult>,
    pub pack_res:   Vec<RSResult>,
    pub after_pk_and_pack_set: MatchDetail,
    pub after_rough_set:       MatchDetail,
}

impl DMFilePackFilterResult {
    pub fn count_pack_res(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for r in &self.pack_res {
            match r.normalize() {
                RSResult::None => counts.0 += 1,
                RSResult::All  => counts.2 += 1,
                _              => counts.1 += 1,
            }
        }
        counts
    }
}

/// delta 层相对 stable 的覆盖情况，用于多版本 skip 判定
#[derive(Debug, Clone, Default)]
pub struct DeltaIndexSummary {
    /// delta 中所有行的 handle（有序）
    pub handles:       Vec<RowKeyValue>,
    pub delete_ranges: Vec<RowKeyRange>,
}

impl DeltaIndexSummary {
    fn touches(&self, pack_range: &RowKeyRange) -> bool {
        let lo = self.handles.partition_point(|h| h < &pack_range.start);
        let hit_handle = self.handles.get(lo).is_some_and(|h| pack_range.check_end(h));
        hit_handle || self.delete_ranges.iter().any(|d| d.intersect(pack_range))
    }

    fn covers(&self, pack_range: &RowKeyRange) -> bool {
        self.delete_ranges.iter().any(|d| d.check_range_included(pack_range))
    }
}

pub struct DMFilePackFilter;

impl DMFilePackFilter {
    /// rowkey 区间判定：被某个区间完全包含为 All，有交集为 Some，否则 None
    fn handle_result(pack_range: &RowKeyRange, ranges: &[RowKeyRange]) -> RSResult {
        let mut res = RSResult::None;
        for r in ranges {
            if r.check_range_included(pack_range) {
                return RSResult::All;
            }
            if r.intersect(pack_range) {
                res = RSResult::Some;
            }
        }
        res
    }

    pub fn load_from(
        ctx:        &DMContext,
        dmfile:     &DMFile,
        set_cache_if_miss: bool,
        ranges:     &[RowKeyRange],
        filter:     Option<&RSOperator>,
        read_packs: Option<&HashSet<usize>>,
    ) -> Result<DMFilePackFilterResult> {
        let t0 = Instant::now();
        let stats = dmfile.pack_stats();
        let col_size = ctx.rowkey_column_size;

        let mut handle_res: Vec<RSResult> = stats.iter()
            .map(|s| Self::handle_result(&s.handle_range(col_size), ranges))
            .collect();
        if let Some(allow) = read_packs {
            for (i, r) in handle_res.iter_mut().enumerate() {
                if !allow.contains(&i) {
                    *r = RSResult::None;
                }
            }
        }

        let mut after_pk_and_pack_set = MatchDetail::default();
        for (s, r) in stats.iter().zip(&handle_res) {
            if r.is_use() {
                after_pk_and_pack_set.packs += 1;
                after_pk_and_pack_set.rows  += s.rows;
                after_pk_and_pack_set.bytes += s.bytes;
            }
        }

        let mut pack_res = handle_res.clone();
        if let Some(op) = filter.filter(|_| ctx.config.enable_rough_set_filter) {
            let t1 = Instant::now();
            let mut param = RSCheckParam::new();
            for col in op.column_ids() {
                if let Some((ft, idx)) = Self::load_index(ctx, dmfile, col, set_cache_if_miss)? {
                    param.insert(col, ft, idx);
                }
            }
            for (i, r) in pack_res.iter_mut().enumerate() {
                if r.is_use() {
                    *r = r.and(op.rough_check(i, &param));
                }
            }
            ScanContext::add(
                &ctx.scan_context.total_dmfile_rough_set_index_check_time_ns,
                t1.elapsed().as_nanos() as u64,
            );
        }

        let mut after_rough_set = MatchDetail::default();
        for (s, r) in stats.iter().zip(&pack_res) {
            if r.is_use() {
                after_rough_set.packs += 1;
                after_rough_set.rows  += s.rows;
                after_rough_set.bytes += s.bytes;
            }
        }

        let result = DMFilePackFilterResult { handle_res, pack_res, after_pk_and_pack_set, after_rough_set };
        let (none, some, all) = result.count_pack_res();
        let sc = &ctx.scan_context;
        ScanContext::add(&sc.rs_pack_filter_none, none as u64);
        ScanContext::add(&sc.rs_pack_filter_some, some as u64);
        ScanContext::add(&sc.rs_pack_filter_all, all as u64);
        ScanContext::add(&sc.total_rs_pack_filter_check_time_ns, t0.elapsed().as_nanos() as u64);
        trace!(
            tracing_id = %ctx.tracing_id, file_id = dmfile.id(), none, some, all,
            "pack filter loaded"
        );
        Ok(result)
    }

    /// 读取 (file, column) 的 min-max 索引，可能来自共享缓存。列不存在时返回 None。
    pub fn load_index(
        ctx:    &DMContext,
        dmfile: &DMFile,
        col_id: ColId,
        set_cache_if_miss: bool,
    ) -> Result<Option<(FieldType, Arc<MinMaxIndex>)>> {
        if dmfile.column_type(col_id).is_none() {
            return Ok(None);
        }
        let load = || -> Result<(FieldType, Arc<MinMaxIndex>)> {
            match dmfile.load_minmax_index(&ctx.io, col_id)? {
                Some((ft, idx)) => Ok((ft, Arc::new(idx))),
                None => Err(crate::common::corruption(format!(
                    "dmfile {} lost minmax index of column {col_id}", dmfile.id()
                ))),
            }
        };
        let Some(cache) = &ctx.index_cache else {
            return load().map(Some);
        };
        let (entry, hit) = cache.get_or_load((dmfile.id(), col_id), set_cache_if_miss, load)?;
        let counter = if hit { &ctx.scan_context.index_cache_hits } else { &ctx.scan_context.index_cache_misses };
        ScanContext::add(counter, 1);
        Ok(Some(entry))
    }

    /// 统计 files 在 range 内的有效行数与字节数。只读 handle 列，不写入索引缓存。
    pub fn load_valid_rows_and_bytes(
        ctx:   &DMContext,
        files: &[Arc<DMFile>],
        range: &RowKeyRange,
    ) -> Result<(usize, u64)> {
        let mut rows  = 0usize;
        let mut bytes = 0u64;
        let ranges = std::slice::from_ref(range);
        for f in files {
            for (pack_id, s) in f.pack_stats().iter().enumerate() {
                match Self::handle_result(&s.handle_range(ctx.rowkey_column_size), ranges) {
                    RSResult::All => {
                        rows  += s.rows;
                        bytes += s.bytes;
                    }
                    RSResult::Some => {
                        let handles = f.read_pack_columns(&ctx.io, pack_id, &[crate::common::EXTRA_HANDLE_COLUMN_ID])?;
                        let matched = handles[0].iter()
                            .filter(|v| match v {
                                Value::Bytes(b) => range.check(&RowKeyValue::from_handle(range.is_common_handle, b)),
                                _ => false,
                            })
                            .count();
                        rows  += matched;
                        bytes += s.bytes * matched as u64 / s.rows.max(1) as u64;
                    }
                    _ => {}
                }
            }
        }
        Ok((rows, bytes))
    }

    /// 与其它 stable 文件的任一 pack 有 handle 重叠时，该 pack 的行可能被覆盖
    fn overlaps_other_files(
        ctx:      &DMContext,
        files:    &[Arc<DMFile>],
        file_idx: usize,
        range:    &RowKeyRange,
    ) -> bool {
        files.iter().enumerate()
            .filter(|(i, _)| *i != file_idx)
            .any(|(_, f)| f.pack_stats().iter().any(|s| s.handle_range(ctx.rowkey_column_size).intersect(range)))
    }

    /// 返回可整段输出的 `(offset, rows)`，offset 为 stable 行位置。
    /// 被选中的 pack 的 handle_res 改为 None，之后的 MVCC 不再读取它们。
    pub fn get_skipped_range_and_filter(
        ctx:          &DMContext,
        files:        &[Arc<DMFile>],
        file_offsets: &[usize],
        results:      &mut [DMFilePackFilterResult],
        start_ts:     Timestamp,
    ) -> Vec<(usize, usize)> {
        Self::skip_impl(ctx, files, file_offsets, results, start_ts, None)
    }

    /// 多版本版本：还要排除被 delta 行或 delete range 触及的 pack；
    /// 被某个 delete range 完全覆盖的 pack 直接丢弃，不输出。
    pub fn get_skipped_range_and_filter_with_multi_version(
        ctx:          &DMContext,
        files:        &[Arc<DMFile>],
        file_offsets: &[usize],
        results:      &mut [DMFilePackFilterResult],
        start_ts:     Timestamp,
        delta:        &DeltaIndexSummary,
    ) -> Vec<(usize, usize)> {
        Self::skip_impl(ctx, files, file_offsets, results, start_ts, Some(delta))
    }

    fn skip_impl(
        ctx:          &DMContext,
        files:        &[Arc<DMFile>],
        file_offsets: &[usize],
        results:      &mut [DMFilePackFilterResult],
        start_ts:     Timestamp,
        delta:        Option<&DeltaIndexSummary>,
    ) -> Vec<(usize, usize)> {
        let mut skipped: Vec<(usize, usize)> = Vec::new();
        if !ctx.config.enable_skip_read {
            return skipped;
        }
        let mut skipped_rows = 0usize;
        for (fi, f) in files.iter().enumerate() {
            let offsets = f.pack_offsets();
            let res = &mut results[fi];
            // 上一个被 skip 的 pack 的下标，用于合并相邻区间
            let mut last_skipped: Option<usize> = None;
            for (pi, s) in f.pack_stats().iter().enumerate() {
                if res.handle_res[pi] != RSResult::All {
                    continue;
                }
                let pack_range = s.handle_range(ctx.rowkey_column_size);
                if let Some(d) = delta {
                    if d.covers(&pack_range) {
                        res.handle_res[pi] = RSResult::None;
                        res.pack_res[pi]   = RSResult::None;
                        continue;
                    }
                    if d.touches(&pack_range) {
                        continue;
                    }
                }
                if s.not_clean > 0 || s.max_version > start_ts {
                    continue;
                }
                if Self::overlaps_other_files(ctx, files, fi, &pack_range) {
                    continue;
                }
                res.handle_res[pi] = RSResult::None;
                skipped_rows += s.rows;
                let offset = file_offsets[fi] + offsets[pi];
                match (last_skipped, skipped.last_mut()) {
                    (Some(prev), Some(last)) if prev + 1 == pi => last.1 += s.rows,
                    _ => skipped.push((offset, s.rows)),
                }
                last_skipped = Some(pi);
            }
        }
        ScanContext::add(&ctx.scan_context.dmfile_mvcc_skipped_rows, skipped_rows as u64);
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Row};
    use crate::compression::CompressionMethod;
    use crate::config::DmConfig;
    use crate::dmfile::DMFileWriter;
    use crate::field_type::ColumnDefine;

    fn ctx() -> DMContext {
        let cols = vec![ColumnDefine::new(1, "v", FieldType::Int64)];
        DMContext::in_memory(DmConfig::default(), cols, false).unwrap()
    }

    fn file(ctx: &DMContext, id: u64, rows: Vec<Row>, pack_rows: usize) -> Arc<DMFile> {
        let mut w = DMFileWriter::new(id, "dmf", &ctx.columns, false, pack_rows, CompressionMethod::Lz4);
        w.write(&Block::new(rows)).unwrap();
        w.finalize(&ctx.io).unwrap()
    }

    fn rows(handles: std::ops::Range<i64>, version: u64) -> Vec<Row> {
        handles.map(|h| Row::new_int(h, version, vec![Value::Int64(h * 2)])).collect()
    }

    fn all() -> Vec<RowKeyRange> { vec![RowKeyRange::new_all(false, 1)] }

    #[test]
    fn rowkey_ranges_classify_packs() {
        let ctx = ctx();
        let f = file(&ctx, 1, rows(0..12, 1), 4);
        let ranges = vec![RowKeyRange::from_handle_range(2, 8, false)];
        let res = DMFilePackFilter::load_from(&ctx, &f, true, &ranges, None, None).unwrap();
        assert_eq!(res.handle_res, vec![RSResult::Some, RSResult::All, RSResult::None]);
        assert_eq!(res.after_pk_and_pack_set.packs, 2);
        assert_eq!(res.after_pk_and_pack_set.rows, 8);
    }

    #[test]
    fn allow_list_forces_none() {
        let ctx = ctx();
        let f = file(&ctx, 1, rows(0..12, 1), 4);
        let allow: HashSet<usize> = [2].into_iter().collect();
        let res = DMFilePackFilter::load_from(&ctx, &f, true, &all(), None, Some(&allow)).unwrap();
        assert_eq!(res.handle_res, vec![RSResult::None, RSResult::None, RSResult::All]);
    }

    #[test]
    fn rough_set_narrows_and_counts() {
        let ctx = ctx();
        // v = 2 * handle: pack0 0..6, pack1 8..14, pack2 16..22
        let f = file(&ctx, 1, rows(0..12, 1), 4);
        let op = RSOperator::greater(1, Value::Int64(7));
        let res = DMFilePackFilter::load_from(&ctx, &f, true, &all(), Some(&op), None).unwrap();
        assert_eq!(res.pack_res, vec![RSResult::None, RSResult::All, RSResult::All]);
        assert_eq!(res.after_rough_set.packs, 2);
        assert_eq!(ScanContext::get(&ctx.scan_context.rs_pack_filter_none), 1);
        assert_eq!(ScanContext::get(&ctx.scan_context.index_cache_misses), 1);
        DMFilePackFilter::load_from(&ctx, &f, true, &all(), Some(&op), None).unwrap();
        assert_eq!(ScanContext::get(&ctx.scan_context.index_cache_hits), 1);
    }

    #[test]
    fn unknown_column_is_conservative() {
        let ctx = ctx();
        let f = file(&ctx, 1, rows(0..8, 1), 4);
        let op = RSOperator::equal(99, Value::Int64(1));
        let res = DMFilePackFilter::load_from(&ctx, &f, false, &all(), Some(&op), None).unwrap();
        assert!(res.pack_res.iter().all(|r| *r == RSResult::Some));
    }

    #[test]
    fn skip_merges_adjacent_clean_packs() {
        let ctx = ctx();
        let mut data = rows(0..12, 5);
        // pack2 有重复 handle
        data.push(Row::new_int(11, 6, vec![Value::Int64(0)]));
        let f = file(&ctx, 1, data, 4);
        let mut results = vec![DMFilePackFilter::load_from(&ctx, &f, true, &all(), None, None).unwrap()];
        let skipped = DMFilePackFilter::get_skipped_range_and_filter(&ctx, &[f.clone()], &[0], &mut results, 10);
        assert_eq!(skipped, vec![(0, 8)]);
        assert_eq!(results[0].handle_res[..2], [RSResult::None, RSResult::None]);
        assert_eq!(results[0].handle_res[2], RSResult::All);
        assert!(results[0].pack_res[0].is_use());
    }

    #[test]
    fn newer_versions_are_not_skipped() {
        let ctx = ctx();
        let f = file(&ctx, 1, rows(0..8, 20), 4);
        let mut results = vec![DMFilePackFilter::load_from(&ctx, &f, true, &all(), None, None).unwrap()];
        let skipped = DMFilePackFilter::get_skipped_range_and_filter(&ctx, &[f], &[0], &mut results, 10);
        assert!(skipped.is_empty());
    }

    #[test]
    fn multi_version_respects_delta() {
        let ctx = ctx();
        let f = file(&ctx, 1, rows(0..12, 1), 4);
        let mut results = vec![DMFilePackFilter::load_from(&ctx, &f, true, &all(), None, None).unwrap()];
        let delta = DeltaIndexSummary {
            handles:       vec![RowKeyValue::from_int_handle(5)],
            delete_ranges: vec![RowKeyRange::from_handle_range(8, 100, false)],
        };
        let skipped = DMFilePackFilter::get_skipped_range_and_filter_with_multi_version(
            &ctx, &[f], &[0], &mut results, 10, &delta,
        );
        assert_eq!(skipped, vec![(0, 4)]);
        assert_eq!(results[0].handle_res, vec![RSResult::None, RSResult::All, RSResult::None]);
        assert_eq!(results[0].pack_res[2], RSResult::None);
    }

    #[test]
    fn overlapping_files_are_not_skipped() {
        let ctx = ctx();
        let f1 = file(&ctx, 1, rows(0..4, 1), 4);
        let f2 = file(&ctx, 2, rows(2..6, 1), 4);
        let files = vec![f1.clone(), f2.clone()];
        let mut results = vec![
            DMFilePackFilter::load_from(&ctx, &f1, true, &all(), None, None).unwrap(),
            DMFilePackFilter::load_from(&ctx, &f2, true, &all(), None, None).unwrap(),
        ];
        let skipped = DMFilePackFilter::get_skipped_range_and_filter(&ctx, &files, &[0, 4], &mut results, 10);
        assert!(skipped.is_empty());
    }

    #[test]
    fn valid_rows_counts_partial_packs() {
        let ctx = ctx();
        let f = file(&ctx, 1, rows(0..12, 1), 4);
        let (rows, _) = DMFilePackFilter::load_valid_rows_and_bytes(
            &ctx, &[f], &RowKeyRange::from_handle_range(2, 9, false),
        ).unwrap();
        assert_eq!(rows, 7);
    }
}
