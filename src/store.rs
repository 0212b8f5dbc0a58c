//! 顶层存储协调器：rowkey 键空间到 segment 的划分
//!
//! 所有 segment 的区间首尾相接、恰好覆盖整个键空间。映射以区间终点为键，
//! 查找某个 key 所在的 segment 就是找第一个终点大于它的 segment。
//!
//! segment 的结构变更在映射锁之外执行，完成后再在写锁下替换映射。
//! 写入若落到已被取代的 segment 上，会重新查找并重试。
//!
//! 映射中 segment 引用的 DMFile 登记在 `DMFileGc` 中，每次替换映射后回收不再被引用的文件。

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::block::{Block, Row};
use crate::common::{DmError, Result, SegmentId, Timestamp};
use crate::dm_context::DMContext;
use crate::dmfile::DMFile;
use crate::filter::RSOperator;
use crate::rowkey::{KeyspaceId, RowKeyRange, RowKeyValue, TableId, TableRangeMinMax};
use crate::scan_context::ScanContext;
use crate::segment::{Segment, SegmentSnapshot, SplitMode, NO_NEXT_SEGMENT};
use crate::storage_pool::FIRST_SEGMENT_ID;

/// 写入在已取代的 segment 上重试的上限
const MAX_ROUTE_RETRIES: usize = 10_000;

#[derive(Default)]
struct Partition {
    /// 区间终点 → segment
    by_end: BTreeMap<RowKeyValue, Arc<Segment>>,
    by_id:  HashMap<SegmentId, Arc<Segment>>,
}

impl Partition {
    fn insert(&mut self, seg: Arc<Segment>) {
        self.by_end.insert(seg.range().end.clone(), seg.clone());
        self.by_id.insert(seg.segment_id(), seg);
    }

    fn remove(&mut self, seg: &Arc<Segment>) {
        if self.by_end.get(&seg.range().end).is_some_and(|s| Arc::ptr_eq(s, seg)) {
            self.by_end.remove(&seg.range().end);
        }
        if self.by_id.get(&seg.segment_id()).is_some_and(|s| Arc::ptr_eq(s, seg)) {
            self.by_id.remove(&seg.segment_id());
        }
    }

    fn locate(&self, key: &RowKeyValue) -> Option<Arc<Segment>> {
        self.by_end.range((Excluded(key), Unbounded)).next().map(|(_, s)| s.clone())
    }
}

/// 单表的 DeltaMerge 存储
pub struct SegmentStore {
    ctx:       DMContext,
    partition: RwLock<Partition>,
}

impl SegmentStore {
    /// 新建一张表：一个覆盖整个键空间的根 segment
    pub fn create(ctx: DMContext) -> Result<Self> {
        let root = Segment::new_segment(&ctx, ctx.full_range(), FIRST_SEGMENT_ID, NO_NEXT_SEGMENT)?;
        let mut partition = Partition::default();
        partition.insert(root);
        info!(tracing_id = %ctx.tracing_id, "segment store created");
        Ok(Self { ctx, partition: RwLock::new(partition) })
    }

    /// 从 meta 存储恢复：沿 next_segment_id 链依次加载
    pub fn restore(ctx: DMContext) -> Result<Self> {
        let mut partition = Partition::default();
        let mut next = FIRST_SEGMENT_ID;
        while next != NO_NEXT_SEGMENT {
            let seg = Segment::restore(&ctx, next)?;
            if partition.by_id.contains_key(&seg.segment_id()) {
                return Err(DmError::InvariantViolation(format!("segment chain loops at {next}")));
            }
            next = seg.next_segment_id();
            ctx.file_gc.acquire(&seg.dmfiles());
            partition.insert(seg);
        }
        let store = Self { ctx, partition: RwLock::new(partition) };
        store.check_partition()?;
        info!(
            tracing_id = %store.ctx.tracing_id, segments = store.segment_count(),
            "segment store restored"
        );
        Ok(store)
    }

    pub fn context(&self) -> &DMContext { &self.ctx }

    pub fn segment_count(&self) -> usize { self.partition.read().by_id.len() }

    /// 按区间顺序
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.partition.read().by_end.values().cloned().collect()
    }

    pub fn get_segment(&self, segment_id: SegmentId) -> Result<Arc<Segment>> {
        self.partition.read().by_id.get(&segment_id).cloned()
            .ok_or(DmError::SegmentNotFound(segment_id))
    }

    pub fn segment_for_key(&self, key: &RowKeyValue) -> Result<Arc<Segment>> {
        self.partition.read().locate(key).ok_or_else(|| {
            DmError::InvariantViolation(format!("no segment covers key {}", key.to_debug_string()))
        })
    }

    fn overlapping(&self, range: &RowKeyRange) -> Vec<Arc<Segment>> {
        let part = self.partition.read();
        part.by_end.range((Excluded(&range.start), Unbounded))
            .map(|(_, s)| s)
            .take_while(|s| s.range().start < range.end)
            .cloned()
            .collect()
    }

    /// for_update 快照被拒绝（segment 正被占用或已被取代）时返回 `Ok(None)`
    pub fn create_snapshot(&self, segment_id: SegmentId, for_update: bool) -> Result<Option<SegmentSnapshot>> {
        Ok(self.get_segment(segment_id)?.create_snapshot(for_update))
    }

    // ── 写入 ──────────────────────────────────────────────────────────────────

    /// 按 segment 区间切分并写入
    pub fn write(&self, block: Block) -> Result<()> {
        let mut rows = block.rows;
        rows.sort_by(Row::cmp_key);
        let mut rest: &[Row] = &rows;
        let mut retries = 0;
        while let Some(first) = rest.first() {
            let seg = self.segment_for_key(&first.handle)?;
            let n = rest.partition_point(|r| seg.range().check_end(&r.handle));
            if seg.write(&self.ctx, Block::new(rest[..n].to_vec()))? {
                rest = &rest[n..];
                continue;
            }
            retries = self.retry(retries, seg.segment_id())?;
        }
        Ok(())
    }

    pub fn delete_range(&self, range: &RowKeyRange) -> Result<()> {
        if range.none() {
            return Ok(());
        }
        let mut cursor = range.start.clone();
        let mut retries = 0;
        loop {
            let seg = self.segment_for_key(&cursor)?;
            if !seg.write_delete_range(&self.ctx, range) {
                retries = self.retry(retries, seg.segment_id())?;
                continue;
            }
            if seg.range().end >= range.end || seg.range().is_end_infinite() {
                return Ok(());
            }
            cursor = seg.range().end.clone();
        }
    }

    /// 以引用方式导入外部 DMFile 到所有相交的 segment，并落盘 delta
    pub fn ingest(&self, range: &RowKeyRange, files: &[Arc<DMFile>], clear_data_in_range: bool) -> Result<()> {
        if range.none() {
            return Ok(());
        }
        let mut cursor = range.start.clone();
        let mut retries = 0;
        loop {
            let seg = self.segment_for_key(&cursor)?;
            if !seg.ingest_data_to_delta(&self.ctx, range, files, clear_data_in_range)? {
                retries = self.retry(retries, seg.segment_id())?;
                continue;
            }
            self.ctx.file_gc.acquire(files);
            seg.flush_cache(&self.ctx)?;
            if seg.range().end >= range.end || seg.range().is_end_infinite() {
                return Ok(());
            }
            cursor = seg.range().end.clone();
        }
    }

    fn retry(&self, retries: usize, segment_id: SegmentId) -> Result<usize> {
        if retries >= MAX_ROUTE_RETRIES {
            error!(tracing_id = %self.ctx.tracing_id, segment_id, retries, "segment stays retired");
            return Err(DmError::InvariantViolation(format!(
                "segment {segment_id} is retired but still mapped"
            )));
        }
        std::thread::yield_now();
        Ok(retries + 1)
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    /// MVCC 读。`ctx` 通常是 `context().for_query(..)`，统计计入其中。
    pub fn read(
        &self,
        ctx:        &DMContext,
        ranges:     &[RowKeyRange],
        filter:     Option<&RSOperator>,
        start_ts:   Timestamp,
        block_size: usize,
    ) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        for seg in self.read_targets(ranges) {
            ScanContext::add(&ctx.scan_context.num_read_tasks, 1);
            let snap = seg.read_snapshot();
            out.extend(seg.get_input_stream_mode_normal(ctx, &snap, ranges, filter, start_ts, block_size)?);
        }
        Ok(out)
    }

    pub fn read_raw(&self, ctx: &DMContext, ranges: &[RowKeyRange], block_size: usize) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        for seg in self.read_targets(ranges) {
            let snap = seg.read_snapshot();
            out.extend(seg.get_input_stream_mode_raw(ctx, &snap, ranges, block_size)?);
        }
        Ok(out)
    }

    fn read_targets(&self, ranges: &[RowKeyRange]) -> Vec<Arc<Segment>> {
        let mut segs: Vec<Arc<Segment>> = ranges.iter()
            .filter(|r| !r.none())
            .flat_map(|r| self.overlapping(r))
            .collect();
        segs.sort_by(|a, b| a.range().start.cmp(&b.range().start));
        segs.dedup_by_key(|s| s.segment_id());
        segs
    }

    // ── 结构变更 ──────────────────────────────────────────────────────────────

    fn replace(&self, old: &[Arc<Segment>], new: &[Arc<Segment>]) -> Result<()> {
        {
            let mut part = self.partition.write();
            for s in old {
                part.remove(s);
            }
            for s in new {
                part.insert(s.clone());
            }
        }
        let gc = &self.ctx.file_gc;
        for s in new {
            gc.acquire(&s.dmfiles());
        }
        for s in old {
            gc.release(&s.dmfiles());
        }
        if self.ctx.config.check_structural_invariants {
            self.check_partition()?;
        }
        self.gc_dmfiles();
        Ok(())
    }

    /// 删除已没有 segment 与快照引用的 DMFile，返回删除的个数
    pub fn gc_dmfiles(&self) -> usize {
        self.ctx.file_gc.sweep(&self.ctx)
    }

    pub fn segment_split(
        &self,
        segment_id: SegmentId,
        split_at:   Option<RowKeyValue>,
        mode:       SplitMode,
    ) -> Result<Option<(SegmentId, SegmentId)>> {
        let seg = self.get_segment(segment_id)?;
        let Some((left, right)) = seg.split(&self.ctx, split_at, mode)? else {
            return Ok(None);
        };
        let ids = (left.segment_id(), right.segment_id());
        self.replace(&[seg], &[left, right])?;
        Ok(Some(ids))
    }

    pub fn segment_merge(&self, segment_ids: &[SegmentId]) -> Result<Option<SegmentId>> {
        let segs = segment_ids.iter()
            .map(|&id| self.get_segment(id))
            .collect::<Result<Vec<_>>>()?;
        let Some(merged) = Segment::merge(&self.ctx, &segs)? else {
            return Ok(None);
        };
        let id = merged.segment_id();
        self.replace(&segs, &[merged])?;
        Ok(Some(id))
    }

    pub fn segment_merge_delta(&self, segment_id: SegmentId) -> Result<bool> {
        let seg = self.get_segment(segment_id)?;
        let Some(new_seg) = seg.merge_delta(&self.ctx)? else {
            return Ok(false);
        };
        self.replace(&[seg], &[new_seg])?;
        Ok(true)
    }

    pub fn segment_flush_cache(&self, segment_id: SegmentId) -> Result<bool> {
        self.get_segment(segment_id)?.flush_cache(&self.ctx)
    }

    pub fn segment_compact_delta(&self, segment_id: SegmentId) -> Result<bool> {
        self.get_segment(segment_id)?.compact_delta(&self.ctx)
    }

    pub fn segment_replace_data(
        &self,
        segment_id: SegmentId,
        file:       Arc<DMFile>,
        snap:       Option<&SegmentSnapshot>,
    ) -> Result<bool> {
        let seg = self.get_segment(segment_id)?;
        let Some(new_seg) = seg.replace_data(&self.ctx, file, snap)? else {
            return Ok(false);
        };
        self.replace(&[seg], &[new_seg])?;
        Ok(true)
    }

    pub fn segment_replace_stable_meta_version(&self, segment_id: SegmentId, files: &[Arc<DMFile>]) -> Result<bool> {
        let seg = self.get_segment(segment_id)?;
        let Some(new_seg) = seg.replace_stable_meta_version(&self.ctx, files)? else {
            return Ok(false);
        };
        self.replace(&[seg], &[new_seg])?;
        Ok(true)
    }

    /// mem table 超过 `delta_cache_limit_rows` 的 segment
    pub fn segments_need_flush(&self) -> Vec<SegmentId> {
        let limit = self.ctx.config.delta_cache_limit_rows;
        self.segments().iter()
            .filter(|s| s.delta().mem_table_rows() >= limit)
            .map(|s| s.segment_id())
            .collect()
    }

    /// 估计行数超过 `segment_limit_rows` 的 segment
    pub fn segments_need_split(&self) -> Vec<SegmentId> {
        let limit = self.ctx.config.segment_limit_rows;
        self.segments().iter()
            .filter(|s| s.estimated_rows() > limit)
            .map(|s| s.segment_id())
            .collect()
    }

    // ── 校验 ──────────────────────────────────────────────────────────────────

    /// 区间无空洞、无重叠，覆盖整个键空间，且 next 指针与顺序一致
    pub fn check_partition(&self) -> Result<()> {
        let part = self.partition.read();
        let is_common = self.ctx.is_common_handle;
        let mut expected_start = RowKeyValue::min_key(is_common).clone();
        let mut prev: Option<&Arc<Segment>> = None;
        let fail = |msg: String| {
            error!(tracing_id = %self.ctx.tracing_id, "{msg}");
            Err(DmError::InvariantViolation(msg))
        };

        for (end, seg) in &part.by_end {
            let range = seg.range();
            if range.start != expected_start {
                return fail(format!(
                    "segment {} starts at {}, expect {}",
                    seg.segment_id(), range.start.to_debug_string(), expected_start.to_debug_string()
                ));
            }
            if &range.end != end || range.none() {
                return fail(format!("segment {} has bad range {}", seg.segment_id(), range.to_debug_string()));
            }
            if let Some(p) = prev {
                if p.next_segment_id() != seg.segment_id() {
                    return fail(format!(
                        "segment {} points to {}, but {} follows",
                        p.segment_id(), p.next_segment_id(), seg.segment_id()
                    ));
                }
            }
            expected_start = range.end.clone();
            prev = Some(seg);
        }
        if expected_start != *RowKeyValue::max_key(is_common) {
            return fail(format!("keyspace ends at {}", expected_start.to_debug_string()));
        }
        if prev.is_some_and(|p| p.next_segment_id() != NO_NEXT_SEGMENT) {
            return fail("last segment has a successor".to_string());
        }
        if part.by_id.len() != part.by_end.len() {
            return fail(format!("{} segments by id, {} by range", part.by_id.len(), part.by_end.len()));
        }
        debug!(tracing_id = %self.ctx.tracing_id, segments = part.by_end.len(), "partition checked");
        Ok(())
    }

    /// 表在 region 键空间中的最小/最大记录键
    pub fn table_region_range(&self, keyspace_id: Option<KeyspaceId>, table_id: TableId) -> Arc<TableRangeMinMax> {
        self.ctx.table_range_cache.get(keyspace_id, table_id, self.ctx.is_common_handle)
    }
}
