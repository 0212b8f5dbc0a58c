//! Segment：一段连续 rowkey 区间的数据单元
//!
//! 每个 segment 由一个 delta 层和一个 stable 层组成。`Segment` 对象本身不可变，
//! 结构变更（split / merge / merge_delta / replace）都产生新的对象，旧对象的
//! delta 被弃用后进入 Retired 状态，持有旧层的快照照常可读。
//!
//! 结构变更持有 delta 的更新锁；普通写入与读取不需要该锁。

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::bitmap::BitmapFilter;
use crate::block::{Block, Row};
use crate::common::{DmError, Result, SegmentId, Timestamp};
use crate::delta::{release_pages, ColumnFile, DeltaSnapshot, DeltaValueSpace};
use crate::dm_context::DMContext;
use crate::dmfile::{DMFile, DMFileWriter};
use crate::filter::RSOperator;
use crate::meta::{ColumnFileDescriptor, SegmentMeta};
use crate::pack_filter::{DMFilePackFilter, DeltaIndexSummary};
use crate::rowkey::{shrink_ranges, RowKeyRange, RowKeyValue};
use crate::scan_context::ScanContext;
use crate::stable::StableValueSpace;

/// 最后一个 segment 的 `next_segment_id`
pub const NO_NEXT_SEGMENT: SegmentId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Active,
    /// 正在进行结构变更
    Locked,
    /// 已被新的 segment 对象取代
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// 按配置在逻辑 / 物理之间选择
    Auto,
    /// 共享 stable 文件，delta 文件按区间收窄
    Logical,
    /// 重写两边的 stable 文件
    Physical,
}

/// 某一时刻 delta 与 stable 层的不可变视图
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub segment_id: SegmentId,
    pub epoch:      u64,
    pub delta:      DeltaSnapshot,
    pub stable:     Arc<StableValueSpace>,
}

impl SegmentSnapshot {
    /// MVCC 之前的估计行数
    pub fn rows(&self) -> usize {
        self.delta.rows() + self.stable.valid_rows()
    }

    pub fn bytes(&self) -> u64 {
        self.delta.bytes() as u64 + self.stable.valid_bytes()
    }
}

/// split 时一侧的新数据
struct SplitHalf {
    persisted: Vec<Arc<ColumnFile>>,
    mem_table: Vec<Arc<ColumnFile>>,
    stable:    StableValueSpace,
}

impl SplitHalf {
    fn snapshot(&self, segment_id: SegmentId) -> SegmentSnapshot {
        SegmentSnapshot {
            segment_id,
            epoch: 0,
            delta: DeltaSnapshot::detached(self.persisted.clone(), self.mem_table.clone()),
            stable: Arc::new(self.stable.clone()),
        }
    }
}

/// MVCC 的输入行
struct Candidate {
    /// 在 stable + delta 行号空间中的位置
    pos:        usize,
    row:        Row,
    /// delta 行所在 column file 的位置，stable 行为 None
    delta_file: Option<usize>,
    /// 所在 pack 的 rough set 结果可用
    output:     bool,
}

#[derive(Debug)]
pub struct Segment {
    segment_id:      SegmentId,
    epoch:           u64,
    range:           RowKeyRange,
    next_segment_id: SegmentId,
    delta:           Arc<DeltaValueSpace>,
    stable:          Arc<StableValueSpace>,
}

impl Segment {
    /// 新建一个空 segment 并持久化元数据
    pub fn new_segment(
        ctx:             &DMContext,
        range:           RowKeyRange,
        segment_id:      SegmentId,
        next_segment_id: SegmentId,
    ) -> Result<Arc<Segment>> {
        let pool = &ctx.storage_pool;
        let segment = Arc::new(Segment {
            segment_id,
            epoch: ctx.next_epoch(),
            range,
            next_segment_id,
            delta:  Arc::new(DeltaValueSpace::new(pool.new_log_page_id())),
            stable: Arc::new(StableValueSpace::empty(pool.new_log_page_id())),
        });
        segment.save_meta(ctx)?;
        debug!(tracing_id = %ctx.tracing_id, segment_id, range = %segment.range.to_debug_string(), "segment created");
        Ok(segment)
    }

    pub fn segment_id(&self)      -> SegmentId           { self.segment_id }
    pub fn epoch(&self)           -> u64                 { self.epoch }
    pub fn range(&self)           -> &RowKeyRange        { &self.range }
    pub fn next_segment_id(&self) -> SegmentId           { self.next_segment_id }
    pub fn delta(&self)           -> &Arc<DeltaValueSpace> { &self.delta }
    pub fn stable(&self)          -> &Arc<StableValueSpace> { &self.stable }

    pub fn state(&self) -> SegmentState {
        if self.delta.is_abandoned() {
            SegmentState::Retired
        } else if self.delta.is_updating() {
            SegmentState::Locked
        } else {
            SegmentState::Active
        }
    }

    pub fn is_abandoned(&self) -> bool { self.delta.is_abandoned() }

    /// 本 segment 引用的 DMFile：stable 文件与 delta 中的 Big 文件
    pub fn dmfiles(&self) -> Vec<Arc<DMFile>> {
        let mut files = self.stable.files().to_vec();
        files.extend(self.delta.big_files());
        files
    }

    pub fn estimated_rows(&self) -> usize {
        self.delta.rows() + self.stable.valid_rows()
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.delta.bytes() as u64 + self.stable.valid_bytes()
    }

    // ── 写入 ──────────────────────────────────────────────────────────────────

    /// 写入一个块。所有行必须落在本 segment 区间内；
    /// segment 已被取代时返回 false，调用方应重新路由。
    pub fn write(&self, ctx: &DMContext, block: Block) -> Result<bool> {
        block.check_schema(&ctx.columns)?;
        if let Some(r) = block.rows.iter().find(|r| !self.range.check(&r.handle)) {
            return Err(DmError::InvariantViolation(format!(
                "row {} written to segment {} with range {}",
                r.handle.to_debug_string(), self.segment_id, self.range.to_debug_string()
            )));
        }
        if block.is_empty() {
            return Ok(true);
        }
        Ok(self.delta.append_block(ctx, block))
    }

    /// 删除区间与本 segment 的交集；交集为空时什么都不做
    pub fn write_delete_range(&self, ctx: &DMContext, range: &RowKeyRange) -> bool {
        let range = range.shrink(&self.range);
        if range.none() {
            return !self.delta.is_abandoned();
        }
        self.delta.append_delete_range(ctx, range)
    }

    /// 以引用方式导入外部 DMFile
    pub fn ingest_data_to_delta(
        &self,
        ctx:   &DMContext,
        range: &RowKeyRange,
        files: &[Arc<DMFile>],
        clear_data_in_range: bool,
    ) -> Result<bool> {
        let range = range.shrink(&self.range);
        if range.none() {
            return Ok(!self.delta.is_abandoned());
        }
        let ok = self.delta.ingest_column_files(ctx, &range, files, clear_data_in_range);
        debug!(
            tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
            files = files.len(), clear_data_in_range, ok, "ingest to delta"
        );
        Ok(ok)
    }

    /// 读快照
    pub fn read_snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot {
            segment_id: self.segment_id,
            epoch:      self.epoch,
            delta:      self.delta.read_snapshot(),
            stable:     self.stable.clone(),
        }
    }

    /// `for_update` 的快照在存活期间独占本 segment 的结构变更；
    /// 已有其他 for_update 快照、delta 正在 flush / compact 或 segment 已被取代时返回 None
    pub fn create_snapshot(&self, for_update: bool) -> Option<SegmentSnapshot> {
        Some(SegmentSnapshot {
            segment_id: self.segment_id,
            epoch:      self.epoch,
            delta:      self.delta.create_snapshot(for_update)?,
            stable:     self.stable.clone(),
        })
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    /// MVCC 读：每个 handle 取版本 <= `start_ts` 的最新一行，删除标记与被
    /// delete range 隐藏的行不输出。rough set 判定为 None 的 pack 不输出。
    /// 结果按 handle 有序，每块至多 `block_size` 行。
    pub fn get_input_stream_mode_normal(
        &self,
        ctx:        &DMContext,
        snap:       &SegmentSnapshot,
        ranges:     &[RowKeyRange],
        filter:     Option<&RSOperator>,
        start_ts:   Timestamp,
        block_size: usize,
    ) -> Result<Vec<Block>> {
        let sc = &ctx.scan_context;
        ScanContext::add(&sc.num_segments, 1);
        let read_ranges = shrink_ranges(&self.range, ranges);
        if read_ranges.is_empty() {
            return Ok(Vec::new());
        }
        let in_read_ranges = |h: &RowKeyValue| read_ranges.iter().any(|r| r.check(h));

        let files = snap.stable.files();
        let file_offsets = snap.stable.file_offsets();
        let stable_rows = snap.stable.total_rows();

        let mut results = files.iter()
            .map(|f| DMFilePackFilter::load_from(ctx, f, true, &read_ranges, filter, None))
            .collect::<Result<Vec<_>>>()?;

        let mut delta = snap.delta.read(ctx, &self.range)?;
        let delta_rows: Vec<(Row, usize)> = std::mem::take(&mut delta.rows)
            .into_iter()
            .filter(|(r, _)| in_read_ranges(&r.handle))
            .collect();
        let mut summary = DeltaIndexSummary {
            handles:       delta_rows.iter().map(|(r, _)| r.handle.clone()).collect(),
            delete_ranges: delta.delete_ranges.iter().map(|(_, r)| r.clone()).collect(),
        };
        summary.handles.sort();

        let skipped = DMFilePackFilter::get_skipped_range_and_filter_with_multi_version(
            ctx, files, &file_offsets, &mut results, start_ts, &summary,
        );
        let mut bitmap = BitmapFilter::new(stable_rows + delta_rows.len(), false);
        for &(offset, rows) in &skipped {
            bitmap.set_range(offset, rows, true);
        }

        // ── MVCC 输入：handle 区间内、未被 skip 的 pack ─────────────────────
        let t0 = Instant::now();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut skipped_packs: Vec<(usize, usize)> = Vec::new();
        for (fi, f) in files.iter().enumerate() {
            let pack_offsets = f.pack_offsets();
            let res = &results[fi];
            for (pi, stat) in f.pack_stats().iter().enumerate() {
                let counter = if res.pack_res[pi].is_use() { &sc.dmfile_data_scanned_rows } else { &sc.dmfile_data_skipped_rows };
                ScanContext::add(counter, stat.rows as u64);

                let pos = file_offsets[fi] + pack_offsets[pi];
                if skipped.iter().any(|&(o, n)| pos >= o && pos < o + n) {
                    skipped_packs.push((fi, pi));
                    continue;
                }
                if !res.handle_res[pi].is_use() {
                    continue;
                }
                sc.check_cancelled()?;
                let rows = f.read_pack_rows(&ctx.io, pi)?;
                ScanContext::add(&sc.dmfile_mvcc_scanned_rows, rows.len() as u64);
                let output = res.pack_res[pi].is_use();
                for (i, row) in rows.into_iter().enumerate() {
                    if in_read_ranges(&row.handle) {
                        candidates.push(Candidate { pos: pos + i, row, delta_file: None, output });
                    }
                }
            }
        }
        for (i, (row, file_pos)) in delta_rows.into_iter().enumerate() {
            candidates.push(Candidate { pos: stable_rows + i, row, delta_file: Some(file_pos), output: true });
        }
        ScanContext::add(&sc.mvcc_input_rows, candidates.len() as u64);
        ScanContext::add(
            &sc.mvcc_input_bytes,
            candidates.iter().map(|c| c.row.estimated_bytes() as u64).sum(),
        );

        // ── MVCC：同一 handle 中位置靠后、版本较大者胜出 ─────────────────────
        candidates.sort_by(|a, b| {
            a.row.cmp_key(&b.row).then(a.pos.cmp(&b.pos))
        });
        let mut i = 0;
        while i < candidates.len() {
            let mut j = i + 1;
            while j < candidates.len() && candidates[j].row.handle == candidates[i].row.handle {
                j += 1;
            }
            let winner = candidates[i..j].iter().rev().find(|c| {
                c.row.version <= start_ts && !delta.is_deleted(&c.row.handle, c.delta_file)
            });
            if let Some(w) = winner.filter(|w| !w.row.deleted) {
                bitmap.set(w.pos, true);
            }
            i = j;
        }

        let mut out: Vec<Row> = candidates.into_iter()
            .filter(|c| c.output && bitmap.get(c.pos))
            .map(|c| c.row)
            .collect();
        ScanContext::add(&sc.mvcc_output_rows, out.len() as u64);

        for (fi, pi) in skipped_packs {
            if !results[fi].pack_res[pi].is_use() {
                continue;
            }
            sc.check_cancelled()?;
            out.extend(files[fi].read_pack_rows(&ctx.io, pi)?);
        }
        ScanContext::add(&sc.total_dmfile_read_time_ns, t0.elapsed().as_nanos() as u64);

        out.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(Block::new(out).split_into(block_size))
    }

    /// 原始读：不做 MVCC，输出区间内所有版本（含删除标记），只应用 delete range。
    /// 结果按 (handle, version) 有序。
    pub fn get_input_stream_mode_raw(
        &self,
        ctx:        &DMContext,
        snap:       &SegmentSnapshot,
        ranges:     &[RowKeyRange],
        block_size: usize,
    ) -> Result<Vec<Block>> {
        ScanContext::add(&ctx.scan_context.num_segments, 1);
        let read_ranges = shrink_ranges(&self.range, ranges);
        if read_ranges.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<Row> = read_raw_rows(ctx, snap, &self.range)?
            .into_iter()
            .filter(|r| read_ranges.iter().any(|rr| rr.check(&r.handle)))
            .collect();
        Ok(Block::new(rows).split_into(block_size))
    }

    /// 快照中所有不重复 handle 的精确中位数；不足两个不同 handle 时返回 None
    pub fn get_split_point(&self, ctx: &DMContext, snap: &SegmentSnapshot) -> Result<Option<RowKeyValue>> {
        let mut handles: Vec<RowKeyValue> = read_raw_rows(ctx, snap, &self.range)?
            .into_iter()
            .map(|r| r.handle)
            .collect();
        handles.dedup();
        if handles.len() < 2 {
            return Ok(None);
        }
        Ok(Some(handles.swap_remove(handles.len() / 2)))
    }

    // ── 结构变更 ──────────────────────────────────────────────────────────────

    /// 在 `split_at`（缺省时取中位数）处切成 `[start, split_at)` 与 `[split_at, end)`。
    /// 左边沿用原 id，右边分配新 id。无法切分或正在被其他结构变更占用时返回 None。
    pub fn split(
        &self,
        ctx:      &DMContext,
        split_at: Option<RowKeyValue>,
        mode:     SplitMode,
    ) -> Result<Option<(Arc<Segment>, Arc<Segment>)>> {
        let Some(snap) = self.create_snapshot(true) else {
            debug!(tracing_id = %ctx.tracing_id, segment_id = self.segment_id, "split skipped, segment is updating or retired");
            return Ok(None);
        };

        let split_key = match split_at {
            Some(k) => k,
            None => match self.get_split_point(ctx, &snap)? {
                Some(k) => k,
                None => {
                    debug!(tracing_id = %ctx.tracing_id, segment_id = self.segment_id, "too few rows to split");
                    return Ok(None);
                }
            },
        };
        if split_key <= self.range.start || !self.range.check_end(&split_key) {
            warn!(
                tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
                split_at = %split_key.to_debug_string(), range = %self.range.to_debug_string(),
                "split point out of segment range"
            );
            return Ok(None);
        }
        let mode = match mode {
            SplitMode::Auto if ctx.config.enable_logical_split => SplitMode::Logical,
            SplitMode::Auto => SplitMode::Physical,
            m => m,
        };

        let left_range  = RowKeyRange::new(self.range.start.clone(), split_key.clone(), self.range.is_common_handle, self.range.rowkey_column_size);
        let right_range = RowKeyRange::new(split_key.clone(), self.range.end.clone(), self.range.is_common_handle, self.range.rowkey_column_size);
        let right_id = ctx.storage_pool.new_segment_id();

        let (left, right) = match mode {
            SplitMode::Logical => (
                split_logical(ctx, &snap, &left_range)?,
                split_logical(ctx, &snap, &right_range)?,
            ),
            _ => {
                let rows = read_raw_rows(ctx, &snap, &self.range)?;
                let (l, r): (Vec<Row>, Vec<Row>) = rows.into_iter().partition(|row| left_range.check(&row.handle));
                (
                    SplitHalf { persisted: Vec::new(), mem_table: Vec::new(), stable: write_stable(ctx, &left_range, l)? },
                    SplitHalf { persisted: Vec::new(), mem_table: Vec::new(), stable: write_stable(ctx, &right_range, r)? },
                )
            }
        };

        if ctx.config.check_structural_invariants {
            let before = read_raw_rows(ctx, &snap, &self.range)?.len();
            let l = read_raw_rows(ctx, &left.snapshot(self.segment_id), &left_range)?.len();
            let r = read_raw_rows(ctx, &right.snapshot(right_id), &right_range)?.len();
            if l + r != before {
                error!(
                    tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
                    before, left = l, right = r, "row count changed by split"
                );
                return Err(DmError::InvariantViolation(format!(
                    "split of segment {} changed rows: {before} -> {l} + {r}", self.segment_id
                )));
            }
        }

        let newly = self.delta.abandon_and_take_newly_appended(&snap.delta);
        let left_seg  = build_segment(ctx, self.segment_id, left_range, right_id, left, &newly)?;
        let right_seg = build_segment(ctx, right_id, right_range, self.next_segment_id, right, &newly)?;
        left_seg.save_meta(ctx)?;
        right_seg.save_meta(ctx)?;
        release_pages(ctx, &snap.delta);

        info!(
            tracing_id = %ctx.tracing_id, segment_id = self.segment_id, right_id, ?mode,
            split_at = %split_key.to_debug_string(),
            left_rows = left_seg.estimated_rows(), right_rows = right_seg.estimated_rows(),
            "segment split"
        );
        Ok(Some((left_seg, right_seg)))
    }

    /// 合并至少两个相邻的 segment，沿用第一个的 id。
    /// 不相邻或任一 segment 正在被变更时返回 None。
    pub fn merge(ctx: &DMContext, segments: &[Arc<Segment>]) -> Result<Option<Arc<Segment>>> {
        let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
            return Ok(None);
        };
        if segments.len() < 2 {
            return Ok(None);
        }
        for w in segments.windows(2) {
            if w[0].range.end != w[1].range.start || w[0].next_segment_id != w[1].segment_id {
                debug!(
                    tracing_id = %ctx.tracing_id, left = w[0].segment_id, right = w[1].segment_id,
                    "merge skipped, segments are not adjacent"
                );
                return Ok(None);
            }
        }
        let Some(snaps) = segments.iter().map(|s| s.create_snapshot(true)).collect::<Option<Vec<_>>>() else {
            debug!(tracing_id = %ctx.tracing_id, segment_id = first.segment_id, "merge skipped, a segment is updating or retired");
            return Ok(None);
        };
        let mut rows = Vec::new();
        for (s, snap) in segments.iter().zip(&snaps) {
            rows.extend(read_raw_rows(ctx, snap, &s.range)?);
        }
        let before = rows.len();
        let range = RowKeyRange::new(
            first.range.start.clone(),
            last.range.end.clone(),
            first.range.is_common_handle,
            first.range.rowkey_column_size,
        );
        let stable = write_stable(ctx, &range, rows)?;
        if ctx.config.check_structural_invariants && stable.valid_rows() != before {
            error!(
                tracing_id = %ctx.tracing_id, segment_id = first.segment_id,
                before, after = stable.valid_rows(), "row count changed by merge"
            );
            return Err(DmError::InvariantViolation(format!(
                "merge into segment {} changed rows: {before} -> {}", first.segment_id, stable.valid_rows()
            )));
        }

        let mut newly = Vec::new();
        for (s, snap) in segments.iter().zip(&snaps) {
            newly.extend(s.delta.abandon_and_take_newly_appended(&snap.delta));
        }
        let half = SplitHalf { persisted: Vec::new(), mem_table: Vec::new(), stable };
        let merged = build_segment(ctx, first.segment_id, range, last.next_segment_id, half, &newly)?;
        merged.save_meta(ctx)?;
        for (s, snap) in segments.iter().zip(&snaps) {
            release_pages(ctx, &snap.delta);
            if s.segment_id != merged.segment_id {
                if let Err(e) = ctx.storage_pool.meta.remove(s.segment_id) {
                    warn!(segment_id = s.segment_id, error = %e, "remove merged segment meta failed");
                }
            }
        }
        info!(
            tracing_id = %ctx.tracing_id, segment_id = merged.segment_id,
            merged = segments.len(), rows = before, "segments merged"
        );
        Ok(Some(merged))
    }

    /// 把 delta 合入 stable，id 与区间不变
    pub fn merge_delta(&self, ctx: &DMContext) -> Result<Option<Arc<Segment>>> {
        let Some(snap) = self.create_snapshot(true) else {
            return Ok(None);
        };
        let rows = read_raw_rows(ctx, &snap, &self.range)?;
        let before = rows.len();
        let stable = write_stable(ctx, &self.range, rows)?;
        if ctx.config.check_structural_invariants && stable.valid_rows() != before {
            error!(
                tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
                before, after = stable.valid_rows(), "row count changed by merge delta"
            );
            return Err(DmError::InvariantViolation(format!(
                "merge delta of segment {} changed rows: {before} -> {}", self.segment_id, stable.valid_rows()
            )));
        }

        let newly = self.delta.abandon_and_take_newly_appended(&snap.delta);
        let half = SplitHalf { persisted: Vec::new(), mem_table: Vec::new(), stable };
        let seg = build_segment(ctx, self.segment_id, self.range.clone(), self.next_segment_id, half, &newly)?;
        seg.save_meta(ctx)?;
        release_pages(ctx, &snap.delta);
        info!(
            tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
            delta_files = snap.delta.file_count(), rows = before, "delta merged"
        );
        Ok(Some(seg))
    }

    /// 用 `file` 替换全部数据。
    ///
    /// 给定快照时，它必须是本 segment 上仍存活的 for_update 快照（由调用方取得并持有），
    /// 只保留快照之后追加的 delta 数据；快照已过期（属于被取代的对象、epoch 变化、
    /// 不是 for_update）时返回 None。不给快照时本方法自行占用并丢弃全部 delta。
    pub fn replace_data(
        &self,
        ctx:  &DMContext,
        file: Arc<DMFile>,
        snap: Option<&SegmentSnapshot>,
    ) -> Result<Option<Arc<Segment>>> {
        let own;
        let base = match snap {
            Some(s) => {
                let valid = s.segment_id == self.segment_id
                    && s.epoch == self.epoch
                    && self.delta.is_pinned_by(&s.delta);
                if !valid || self.delta.is_abandoned() {
                    ScanContext::add(&ctx.scan_context.num_stale_read, 1);
                    debug!(
                        tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
                        snapshot_epoch = s.epoch, epoch = self.epoch,
                        for_update = s.delta.is_for_update(), "replace data skipped, snapshot is stale"
                    );
                    return Ok(None);
                }
                s
            }
            None => {
                let Some(s) = self.create_snapshot(true) else {
                    return Ok(None);
                };
                own = s;
                &own
            }
        };
        let stable = StableValueSpace::new(ctx, ctx.storage_pool.new_log_page_id(), &self.range, vec![file])?;
        let newly = self.delta.abandon_and_take_newly_appended(&base.delta);
        // 不给快照时连同占用之后追加的数据一起丢弃
        let newly = if snap.is_some() { newly } else { Vec::new() };
        let half = SplitHalf { persisted: Vec::new(), mem_table: Vec::new(), stable };
        let seg = build_segment(ctx, self.segment_id, self.range.clone(), self.next_segment_id, half, &newly)?;
        seg.save_meta(ctx)?;
        release_pages(ctx, &base.delta);
        info!(tracing_id = %ctx.tracing_id, segment_id = self.segment_id, rows = seg.stable.valid_rows(), "data replaced");
        Ok(Some(seg))
    }

    /// 用同一批文件的新元数据版本替换 stable 层；文件集合不一致时返回 None
    /// 旧对象随之进入 Retired，delta 文件原样移交给新对象。
    pub fn replace_stable_meta_version(&self, ctx: &DMContext, files: &[Arc<DMFile>]) -> Result<Option<Arc<Segment>>> {
        let Some(snap) = self.create_snapshot(true) else {
            return Ok(None);
        };
        let same_files = files.len() == self.stable.files().len()
            && files.iter().zip(self.stable.files()).all(|(a, b)| a.id() == b.id());
        if !same_files {
            warn!(
                tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
                "replace stable meta version skipped, file set differs"
            );
            return Ok(None);
        }
        let stable = StableValueSpace::new(ctx, self.stable.id(), &self.range, files.to_vec())?;
        let newly = self.delta.abandon_and_take_newly_appended(&snap.delta);
        let half = SplitHalf {
            persisted: snap.delta.persisted.to_vec(),
            mem_table: snap.delta.mem_table.to_vec(),
            stable,
        };
        let seg = build_segment(ctx, self.segment_id, self.range.clone(), self.next_segment_id, half, &newly)?;
        seg.save_meta(ctx)?;
        debug!(
            tracing_id = %ctx.tracing_id, segment_id = self.segment_id,
            meta_versions = ?files.iter().map(|f| f.meta_version()).collect::<Vec<_>>(),
            "stable meta version replaced"
        );
        Ok(Some(seg))
    }

    /// 把 mem table 落盘并保存元数据
    pub fn flush_cache(&self, ctx: &DMContext) -> Result<bool> {
        if !self.delta.flush(ctx)? {
            return Ok(false);
        }
        self.save_meta(ctx)?;
        Ok(true)
    }

    pub fn compact_delta(&self, ctx: &DMContext) -> Result<bool> {
        if !self.delta.compact(ctx)? {
            return Ok(false);
        }
        self.save_meta(ctx)?;
        Ok(true)
    }

    // ── 元数据 ────────────────────────────────────────────────────────────────

    pub fn to_meta(&self) -> SegmentMeta {
        SegmentMeta {
            segment_id:      self.segment_id,
            epoch:           self.epoch,
            next_segment_id: self.next_segment_id,
            range:           self.range.clone(),
            delta:           self.delta.to_meta(),
            stable:          self.stable.to_meta(),
        }
    }

    pub fn save_meta(&self, ctx: &DMContext) -> Result<()> {
        ctx.storage_pool.meta.put(self.segment_id, self.to_meta().serialize())
    }

    /// 从 meta 存储恢复一个 segment，并推进 id 分配器
    pub fn restore(ctx: &DMContext, segment_id: SegmentId) -> Result<Arc<Segment>> {
        let page = ctx.storage_pool.meta.get(segment_id).map_err(|e| match e {
            DmError::PageNotFound(_) => DmError::SegmentNotFound(segment_id),
            other => other,
        })?;
        let meta = SegmentMeta::deserialize(&page)?;

        let mut max_page = meta.delta.files.iter()
            .map(|d| match d {
                ColumnFileDescriptor::Tiny { id, page_id, .. } => (*id).max(*page_id),
                ColumnFileDescriptor::DeleteRange { id, .. } | ColumnFileDescriptor::Big { id, .. } => *id,
            })
            .max()
            .unwrap_or(0);
        max_page = max_page.max(meta.stable.stable_id);
        let max_file = meta.stable.files.iter().map(|f| f.file_id)
            .chain(meta.delta.files.iter().filter_map(|d| match d {
                ColumnFileDescriptor::Big { file, .. } => Some(file.file_id),
                _ => None,
            }))
            .max()
            .unwrap_or(0);
        ctx.storage_pool.observe_ids(max_page, max_file, meta.segment_id.max(meta.next_segment_id));

        let delta  = DeltaValueSpace::restore(ctx, ctx.storage_pool.new_log_page_id(), &meta.delta)?;
        let stable = StableValueSpace::restore(ctx, &meta.range, &meta.stable)?;
        ctx.observe_epoch(meta.epoch);
        Ok(Arc::new(Segment {
            segment_id,
            epoch:           meta.epoch,
            range:           meta.range,
            next_segment_id: meta.next_segment_id,
            delta:           Arc::new(delta),
            stable:          Arc::new(stable),
        }))
    }
}

// ── 辅助 ──────────────────────────────────────────────────────────────────────

/// 不做 MVCC 的原始行：range 内未被 delete range 隐藏的所有版本，按 (handle, version) 有序
fn read_raw_rows(ctx: &DMContext, snap: &SegmentSnapshot, range: &RowKeyRange) -> Result<Vec<Row>> {
    let mut delta = snap.delta.read(ctx, range)?;
    let delta_rows = std::mem::take(&mut delta.rows);
    let mut rows = Vec::with_capacity(snap.stable.total_rows() + delta_rows.len());
    for f in snap.stable.files() {
        for (pack_id, stat) in f.pack_stats().iter().enumerate() {
            if !stat.handle_range(ctx.rowkey_column_size).intersect(range) {
                continue;
            }
            ctx.scan_context.check_cancelled()?;
            rows.extend(
                f.read_pack_rows(&ctx.io, pack_id)?
                    .into_iter()
                    .filter(|r| range.check(&r.handle) && !delta.is_deleted(&r.handle, None)),
            );
        }
    }
    rows.extend(
        delta_rows.into_iter()
            .filter(|(r, pos)| !delta.is_deleted(&r.handle, Some(*pos)))
            .map(|(r, _)| r),
    );
    // 稳定排序：同 (handle, version) 时 stable 在前，delta 按追加顺序
    rows.sort_by(Row::cmp_key);
    Ok(rows)
}

/// 把有序行写成一个 DMFile 作为新的 stable 层
fn write_stable(ctx: &DMContext, range: &RowKeyRange, rows: Vec<Row>) -> Result<StableValueSpace> {
    let pool = &ctx.storage_pool;
    if rows.is_empty() {
        return Ok(StableValueSpace::empty(pool.new_log_page_id()));
    }
    let mut writer = DMFileWriter::new(
        pool.new_dmfile_id(),
        &ctx.config.dmfile_dir,
        &ctx.columns,
        ctx.is_common_handle,
        ctx.config.pack_rows,
        ctx.config.compression,
    );
    writer.write(&Block::new(rows))?;
    let file = writer.finalize(&ctx.io)?;
    StableValueSpace::new(ctx, pool.new_log_page_id(), range, vec![file])
}

/// 逻辑 split 的一侧：共享 stable 文件，delta 文件收窄到 `range`
fn split_logical(ctx: &DMContext, snap: &SegmentSnapshot, range: &RowKeyRange) -> Result<SplitHalf> {
    let stable = StableValueSpace::new(ctx, ctx.storage_pool.new_log_page_id(), range, snap.stable.files().to_vec())?;
    Ok(SplitHalf {
        persisted: restrict_files(ctx, snap.delta.persisted.iter(), range)?,
        mem_table: restrict_files(ctx, snap.delta.mem_table.iter(), range)?,
        stable,
    })
}

fn restrict_files<'a>(
    ctx:   &DMContext,
    files: impl Iterator<Item = &'a Arc<ColumnFile>>,
    range: &RowKeyRange,
) -> Result<Vec<Arc<ColumnFile>>> {
    let mut out = Vec::new();
    for f in files {
        if let Some(r) = f.restrict_to(ctx, range)? {
            out.push(Arc::new(r));
        }
    }
    Ok(out)
}

/// 组装新 segment；`newly` 是结构变更期间追加到旧 delta 的文件
fn build_segment(
    ctx:             &DMContext,
    segment_id:      SegmentId,
    range:           RowKeyRange,
    next_segment_id: SegmentId,
    half:            SplitHalf,
    newly:           &[Arc<ColumnFile>],
) -> Result<Arc<Segment>> {
    let mut mem_table = half.mem_table;
    mem_table.extend(restrict_files(ctx, newly.iter(), &range)?);
    let delta = DeltaValueSpace::with_files(ctx.storage_pool.new_log_page_id(), half.persisted, mem_table);
    Ok(Arc::new(Segment {
        segment_id,
        epoch: ctx.next_epoch(),
        range,
        next_segment_id,
        delta:  Arc::new(delta),
        stable: Arc::new(half.stable),
    }))
}
