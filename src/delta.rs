//! Delta 层
//!
//! 最近写入、尚未合入 stable 的数据。由一串有序的 column file 组成：
//!
//! - `InMemory`    — mem table 中的一个写入块
//! - `Tiny`        — flush 后以页的形式落盘的块
//! - `DeleteRange` — 删除一个 rowkey 区间
//! - `Big`         — 外部导入的 DMFile 引用
//!
//! 文件列表是写时复制的：每次追加或结构变更都换一个新的 `Arc<Vec<_>>`，
//! 已有快照持有旧列表，不受影响。
//!
//! delete range 的语义：位于第 k 个位置的 delete range 隐藏其区间内的 stable 行，
//! 以及位置小于 k 的 column file 中的行。

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::ReadBytesExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::block::{Block, Row};
use crate::codec::{read_count, read_value, read_varint, write_value, write_varint};
use crate::common::{corruption, PageId, Result};
use crate::dm_context::DMContext;
use crate::dmfile::DMFile;
use crate::io::FileIo;
use crate::meta::{ColumnFileDescriptor, DeltaMeta, StableFileRef};
use crate::rowkey::{RowKeyRange, RowKeyValue};
use crate::scan_context::ScanContext;

// ── Tiny 页编码 ───────────────────────────────────────────────────────────────

pub(crate) fn encode_block(block: &Block) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(block.bytes() + 16);
    write_varint(&mut out, block.rows() as u64);
    for r in &block.rows {
        r.handle.write_to(&mut out);
        write_varint(&mut out, r.version);
        out.push(r.deleted as u8);
        write_varint(&mut out, r.values.len() as u64);
        for v in &r.values {
            write_value(&mut out, v)?;
        }
    }
    Ok(out)
}

pub(crate) fn decode_block(data: &[u8]) -> Result<Block> {
    let mut cur = Cursor::new(data);
    // handle 标志 + 长度、版本、删除标记、列数
    let n = read_count(&mut cur, 5, "tiny page row")?;
    let mut rows = Vec::with_capacity(n);
    for _ in 0..n {
        let handle  = RowKeyValue::read_from(&mut cur)?;
        let version = read_varint(&mut cur)?;
        let deleted = cur.read_u8()? != 0;
        let width   = read_varint(&mut cur)? as usize;
        let values  = (0..width).map(|_| read_value(&mut cur)).collect::<Result<Vec<_>>>()?;
        rows.push(Row { handle, version, deleted, values });
    }
    if cur.position() as usize != data.len() {
        return Err(corruption("trailing bytes in tiny page"));
    }
    Ok(Block::new(rows))
}

// ── ColumnFile ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ColumnFileKind {
    InMemory    { block: Arc<Block> },
    /// 数据存于 log 页；`block` 是内存中的解码结果
    Tiny        { page_id: PageId, block: Arc<Block> },
    DeleteRange,
    Big         { file: Arc<DMFile> },
}

#[derive(Debug, Clone)]
pub struct ColumnFile {
    pub id:    u64,
    /// 对携带行的文件是可见区间（逻辑 split 后收窄）；对 delete range 是被删除的区间
    pub range: RowKeyRange,
    pub kind:  ColumnFileKind,
}

impl ColumnFile {
    pub fn delete_range(id: u64, range: RowKeyRange) -> Self {
        Self { id, range, kind: ColumnFileKind::DeleteRange }
    }

    pub fn is_delete_range(&self) -> bool {
        matches!(self.kind, ColumnFileKind::DeleteRange)
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.kind, ColumnFileKind::InMemory { .. })
    }

    /// 文件中的行数（不考虑区间收窄）
    pub fn rows(&self) -> usize {
        match &self.kind {
            ColumnFileKind::InMemory { block } | ColumnFileKind::Tiny { block, .. } => block.rows(),
            ColumnFileKind::DeleteRange => 0,
            ColumnFileKind::Big { file } => file.rows(),
        }
    }

    pub fn bytes(&self) -> usize {
        match &self.kind {
            ColumnFileKind::InMemory { block } | ColumnFileKind::Tiny { block, .. } => block.bytes(),
            ColumnFileKind::DeleteRange => 0,
            ColumnFileKind::Big { file } => file.bytes() as usize,
        }
    }

    /// 读出区间内的所有行，保持文件内顺序
    pub fn read_rows(&self, io: &FileIo) -> Result<Vec<Row>> {
        match &self.kind {
            ColumnFileKind::InMemory { block } | ColumnFileKind::Tiny { block, .. } => {
                Ok(block.rows.iter().filter(|r| self.range.check(&r.handle)).cloned().collect())
            }
            ColumnFileKind::DeleteRange => Ok(Vec::new()),
            ColumnFileKind::Big { file } => {
                let mut out = Vec::with_capacity(file.rows());
                for pack_id in 0..file.pack_count() {
                    out.extend(
                        file.read_pack_rows(io, pack_id)?
                            .into_iter()
                            .filter(|r| self.range.check(&r.handle)),
                    );
                }
                Ok(out)
            }
        }
    }

    /// 收窄到 `range`，用于 split。区间为空时返回 None。
    /// tiny 文件通过 `add_ref` 得到新的页 id，新旧文件各自可独立删除。
    pub fn restrict_to(&self, ctx: &DMContext, range: &RowKeyRange) -> Result<Option<ColumnFile>> {
        let new_range = self.range.shrink(range);
        if new_range.none() {
            return Ok(None);
        }
        let pool = &ctx.storage_pool;
        let kind = match &self.kind {
            ColumnFileKind::Tiny { page_id, block } => {
                let new_page = pool.new_log_page_id();
                pool.log.add_ref(new_page, *page_id)?;
                ColumnFileKind::Tiny { page_id: new_page, block: block.clone() }
            }
            other => other.clone(),
        };
        Ok(Some(ColumnFile { id: pool.new_log_page_id(), range: new_range, kind }))
    }

    fn descriptor(&self) -> Option<ColumnFileDescriptor> {
        let range = self.range.clone();
        match &self.kind {
            ColumnFileKind::InMemory { .. } => None,
            ColumnFileKind::Tiny { page_id, block } => Some(ColumnFileDescriptor::Tiny {
                id: self.id, range, page_id: *page_id, rows: block.rows(),
            }),
            ColumnFileKind::DeleteRange => Some(ColumnFileDescriptor::DeleteRange { id: self.id, range }),
            ColumnFileKind::Big { file } => Some(ColumnFileDescriptor::Big {
                id: self.id,
                range,
                file: StableFileRef {
                    file_id:      file.id(),
                    path:         file.path().to_string(),
                    meta_version: file.meta_version(),
                },
            }),
        }
    }

    fn restore(ctx: &DMContext, desc: &ColumnFileDescriptor) -> Result<Self> {
        Ok(match desc {
            ColumnFileDescriptor::Tiny { id, range, page_id, rows } => {
                let page  = ctx.storage_pool.log.get(*page_id)?;
                let block = decode_block(&page)?;
                if block.rows() != *rows {
                    return Err(corruption(format!(
                        "tiny page {page_id} holds {} rows, meta says {rows}", block.rows()
                    )));
                }
                ColumnFile {
                    id: *id,
                    range: range.clone(),
                    kind: ColumnFileKind::Tiny { page_id: *page_id, block: Arc::new(block) },
                }
            }
            ColumnFileDescriptor::DeleteRange { id, range } => ColumnFile::delete_range(*id, range.clone()),
            ColumnFileDescriptor::Big { id, range, file } => {
                let dmfile = DMFile::open(&ctx.io, file.file_id, &file.path)?.with_meta_version(file.meta_version);
                ColumnFile { id: *id, range: range.clone(), kind: ColumnFileKind::Big { file: Arc::new(dmfile) } }
            }
        })
    }
}

// ── 快照 ──────────────────────────────────────────────────────────────────────

/// 在 delta 层上看到的所有行，以及 delete range 的位置
#[derive(Debug, Default)]
pub struct DeltaRows {
    /// (行, 所在 column file 的位置)
    pub rows:          Vec<(Row, usize)>,
    /// (位置, 区间)
    pub delete_ranges: Vec<(usize, RowKeyRange)>,
}

impl DeltaRows {
    /// 位于 `pos` 的行（stable 行用 None）是否被之后的 delete range 隐藏
    pub fn is_deleted(&self, handle: &RowKeyValue, pos: Option<usize>) -> bool {
        self.delete_ranges.iter().any(|(k, r)| pos.map_or(true, |p| p < *k) && r.check(handle))
    }
}

/// delta 的更新占用。同一时刻至多一个；最后一个持有者释放时解除。
#[derive(Debug)]
pub struct UpdatePin {
    flag: Arc<AtomicBool>,
}

impl Drop for UpdatePin {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct DeltaSnapshot {
    pub persisted: Arc<Vec<Arc<ColumnFile>>>,
    pub mem_table: Arc<Vec<Arc<ColumnFile>>>,
    /// for_update 快照持有更新占用：存活期间 delta 不会被 flush / compact / 结构变更改写
    pub(crate) update_pin: Option<Arc<UpdatePin>>,
}

impl DeltaSnapshot {
    /// 只由内存中的文件组成、不占用任何 delta 的快照
    pub fn detached(persisted: Vec<Arc<ColumnFile>>, mem_table: Vec<Arc<ColumnFile>>) -> Self {
        Self { persisted: Arc::new(persisted), mem_table: Arc::new(mem_table), update_pin: None }
    }

    pub fn is_for_update(&self) -> bool { self.update_pin.is_some() }

    /// 按追加顺序遍历
    pub fn files(&self) -> impl Iterator<Item = &Arc<ColumnFile>> {
        self.persisted.iter().chain(self.mem_table.iter())
    }

    pub fn file_count(&self) -> usize {
        self.persisted.len() + self.mem_table.len()
    }

    pub fn rows(&self) -> usize {
        self.files().map(|f| f.rows()).sum()
    }

    pub fn bytes(&self) -> usize {
        self.files().map(|f| f.bytes()).sum()
    }

    pub fn delete_range_count(&self) -> usize {
        self.files().filter(|f| f.is_delete_range()).count()
    }

    fn ids(&self) -> HashSet<u64> {
        self.files().map(|f| f.id).collect()
    }

    /// 读出 `range` 内的 delta 行
    pub fn read(&self, ctx: &DMContext, range: &RowKeyRange) -> Result<DeltaRows> {
        let mut out = DeltaRows::default();
        let mut bytes = 0usize;
        for (pos, f) in self.files().enumerate() {
            if f.is_delete_range() {
                let r = f.range.shrink(range);
                if !r.none() {
                    out.delete_ranges.push((pos, r));
                }
                continue;
            }
            if !f.range.intersect(range) {
                continue;
            }
            for row in f.read_rows(&ctx.io)? {
                if range.check(&row.handle) {
                    bytes += row.estimated_bytes();
                    out.rows.push((row, pos));
                }
            }
        }
        ScanContext::add(&ctx.scan_context.delta_rows, out.rows.len() as u64);
        ScanContext::add(&ctx.scan_context.delta_bytes, bytes as u64);
        Ok(out)
    }
}

// ── DeltaValueSpace ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct DeltaState {
    persisted: Arc<Vec<Arc<ColumnFile>>>,
    mem_table: Arc<Vec<Arc<ColumnFile>>>,
    /// segment 已被结构变更取代，不再接受写入
    abandoned: bool,
}

pub struct DeltaValueSpace {
    id:       PageId,
    state:    RwLock<DeltaState>,
    updating: Arc<AtomicBool>,
}

impl std::fmt::Debug for DeltaValueSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.read();
        f.debug_struct("DeltaValueSpace")
            .field("id", &self.id)
            .field("persisted", &st.persisted.len())
            .field("mem_table", &st.mem_table.len())
            .field("abandoned", &st.abandoned)
            .finish()
    }
}

impl DeltaValueSpace {
    pub fn new(id: PageId) -> Self {
        Self::with_files(id, Vec::new(), Vec::new())
    }

    pub fn with_files(id: PageId, persisted: Vec<Arc<ColumnFile>>, mem_table: Vec<Arc<ColumnFile>>) -> Self {
        Self {
            id,
            state: RwLock::new(DeltaState {
                persisted: Arc::new(persisted),
                mem_table: Arc::new(mem_table),
                abandoned: false,
            }),
            updating: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> PageId { self.id }

    pub fn is_abandoned(&self) -> bool { self.state.read().abandoned }

    /// 取得更新占用；已被 flush / compact / 其他 for_update 快照占用时返回 None
    fn try_pin_update(&self) -> Option<Arc<UpdatePin>> {
        self.updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Arc::new(UpdatePin { flag: self.updating.clone() }))
    }

    pub fn is_updating(&self) -> bool { self.updating.load(Ordering::Acquire) }

    /// `snap` 是否是本 delta 上仍然存活的 for_update 快照
    pub fn is_pinned_by(&self, snap: &DeltaSnapshot) -> bool {
        snap.update_pin.as_ref().is_some_and(|p| Arc::ptr_eq(&p.flag, &self.updating))
    }

    pub fn rows(&self) -> usize {
        let st = self.state.read();
        st.persisted.iter().chain(st.mem_table.iter()).map(|f| f.rows()).sum()
    }

    pub fn bytes(&self) -> usize {
        let st = self.state.read();
        st.persisted.iter().chain(st.mem_table.iter()).map(|f| f.bytes()).sum()
    }

    pub fn mem_table_rows(&self) -> usize {
        self.state.read().mem_table.iter().map(|f| f.rows()).sum()
    }

    /// 当前 delta 中以引用方式存放的 DMFile
    pub fn big_files(&self) -> Vec<Arc<DMFile>> {
        let st = self.state.read();
        st.persisted.iter().chain(st.mem_table.iter())
            .filter_map(|f| match &f.kind {
                ColumnFileKind::Big { file } => Some(file.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn delete_range_count(&self) -> usize {
        let st = self.state.read();
        st.persisted.iter().chain(st.mem_table.iter()).filter(|f| f.is_delete_range()).count()
    }

    fn append_files(&self, files: Vec<Arc<ColumnFile>>) -> bool {
        let mut st = self.state.write();
        if st.abandoned {
            return false;
        }
        let mut mem = Vec::with_capacity(st.mem_table.len() + files.len());
        mem.extend(st.mem_table.iter().cloned());
        mem.extend(files);
        st.mem_table = Arc::new(mem);
        true
    }

    /// 追加一个写入块；已被弃用时返回 false，调用方应重新路由
    pub fn append_block(&self, ctx: &DMContext, block: Block) -> bool {
        let file = ColumnFile {
            id:    ctx.storage_pool.new_log_page_id(),
            range: ctx.full_range(),
            kind:  ColumnFileKind::InMemory { block: Arc::new(block) },
        };
        self.append_files(vec![Arc::new(file)])
    }

    pub fn append_delete_range(&self, ctx: &DMContext, range: RowKeyRange) -> bool {
        let file = ColumnFile::delete_range(ctx.storage_pool.new_log_page_id(), range);
        self.append_files(vec![Arc::new(file)])
    }

    /// 把外部 DMFile 以引用方式放入 delta；`clear_data_in_range` 时先追加一个 delete range
    pub fn ingest_column_files(
        &self,
        ctx:   &DMContext,
        range: &RowKeyRange,
        files: &[Arc<DMFile>],
        clear_data_in_range: bool,
    ) -> bool {
        let pool = &ctx.storage_pool;
        let mut new_files = Vec::with_capacity(files.len() + 1);
        if clear_data_in_range {
            new_files.push(Arc::new(ColumnFile::delete_range(pool.new_log_page_id(), range.clone())));
        }
        for f in files {
            new_files.push(Arc::new(ColumnFile {
                id:    pool.new_log_page_id(),
                range: range.clone(),
                kind:  ColumnFileKind::Big { file: f.clone() },
            }));
        }
        self.append_files(new_files)
    }

    /// 读快照，总是成功
    pub fn read_snapshot(&self) -> DeltaSnapshot {
        let st = self.state.read();
        DeltaSnapshot {
            persisted:  st.persisted.clone(),
            mem_table:  st.mem_table.clone(),
            update_pin: None,
        }
    }

    /// `for_update` 时快照同时取得更新占用；已有存活的 for_update 快照、
    /// 正在 flush / compact 或 delta 已弃用时返回 None
    pub fn create_snapshot(&self, for_update: bool) -> Option<DeltaSnapshot> {
        if !for_update {
            return Some(self.read_snapshot());
        }
        let pin = self.try_pin_update()?;
        let st = self.state.read();
        if st.abandoned {
            return None;
        }
        Some(DeltaSnapshot {
            persisted:  st.persisted.clone(),
            mem_table:  st.mem_table.clone(),
            update_pin: Some(pin),
        })
    }

    /// 原子地弃用本 delta 并取出 `snap` 之后追加的文件，之后的写入会失败并重新路由
    pub fn abandon_and_take_newly_appended(&self, snap: &DeltaSnapshot) -> Vec<Arc<ColumnFile>> {
        let ids = snap.ids();
        let mut st = self.state.write();
        st.abandoned = true;
        st.persisted.iter().chain(st.mem_table.iter())
            .filter(|f| !ids.contains(&f.id))
            .cloned()
            .collect()
    }

    fn write_tiny(&self, ctx: &DMContext, rows: Vec<Row>) -> Result<Arc<ColumnFile>> {
        let block = Block::new(rows);
        let page_id = ctx.storage_pool.new_log_page_id();
        ctx.storage_pool.log.put(page_id, encode_block(&block)?)?;
        Ok(Arc::new(ColumnFile {
            id:    ctx.storage_pool.new_log_page_id(),
            range: ctx.full_range(),
            kind:  ColumnFileKind::Tiny { page_id, block: Arc::new(block) },
        }))
    }

    /// 把 mem table 落盘：相邻的内存块合并为一个 tiny 页。
    /// 其他结构变更正在进行或已弃用时返回 false。
    pub fn flush(&self, ctx: &DMContext) -> Result<bool> {
        let Some(_pin) = self.try_pin_update() else {
            debug!(delta_id = self.id, "flush skipped, delta is updating");
            return Ok(false);
        };
        let mem = {
            let st = self.state.read();
            if st.abandoned {
                return Ok(false);
            }
            st.mem_table.clone()
        };
        if mem.is_empty() {
            return Ok(true);
        }

        let mut flushed: Vec<Arc<ColumnFile>> = Vec::with_capacity(mem.len());
        let mut pending: Vec<Row> = Vec::new();
        for f in mem.iter() {
            match &f.kind {
                ColumnFileKind::InMemory { block } => {
                    pending.extend(block.rows.iter().filter(|r| f.range.check(&r.handle)).cloned());
                }
                _ => {
                    if !pending.is_empty() {
                        flushed.push(self.write_tiny(ctx, std::mem::take(&mut pending))?);
                    }
                    flushed.push(f.clone());
                }
            }
        }
        if !pending.is_empty() {
            flushed.push(self.write_tiny(ctx, pending)?);
        }

        let mut st = self.state.write();
        if st.abandoned {
            return Ok(false);
        }
        // 占用期间 mem table 只会被追加，`mem` 一定是当前 mem table 的前缀
        let rest: Vec<Arc<ColumnFile>> = st.mem_table[mem.len()..].to_vec();
        let mut persisted = Vec::with_capacity(st.persisted.len() + flushed.len());
        persisted.extend(st.persisted.iter().cloned());
        persisted.extend(flushed);
        st.persisted = Arc::new(persisted);
        st.mem_table = Arc::new(rest);
        debug!(delta_id = self.id, files = mem.len(), "delta flushed");
        Ok(true)
    }

    /// 合并相邻的小 tiny 文件。没有可合并的文件时返回 false。
    pub fn compact(&self, ctx: &DMContext) -> Result<bool> {
        let Some(_pin) = self.try_pin_update() else {
            return Ok(false);
        };
        let persisted = {
            let st = self.state.read();
            if st.abandoned {
                return Ok(false);
            }
            st.persisted.clone()
        };
        let small = ctx.config.delta_small_column_file_rows;
        let is_small = |f: &ColumnFile| matches!(f.kind, ColumnFileKind::Tiny { .. }) && f.rows() < small;

        let mut out: Vec<Arc<ColumnFile>> = Vec::with_capacity(persisted.len());
        let mut obsolete_pages: Vec<PageId> = Vec::new();
        let mut i = 0;
        while i < persisted.len() {
            let mut j = i;
            while j < persisted.len() && is_small(persisted[j].as_ref()) {
                j += 1;
            }
            if j - i >= 2 {
                let mut rows = Vec::new();
                for f in &persisted[i..j] {
                    if let ColumnFileKind::Tiny { page_id, block } = &f.kind {
                        rows.extend(block.rows.iter().filter(|r| f.range.check(&r.handle)).cloned());
                        obsolete_pages.push(*page_id);
                    }
                }
                out.push(self.write_tiny(ctx, rows)?);
                i = j;
            } else {
                out.push(persisted[i].clone());
                i += 1;
            }
        }
        if obsolete_pages.is_empty() {
            return Ok(false);
        }

        {
            let mut st = self.state.write();
            if st.abandoned {
                return Ok(false);
            }
            st.persisted = Arc::new(out);
        }
        for page_id in &obsolete_pages {
            if let Err(e) = ctx.storage_pool.log.remove(*page_id) {
                warn!(delta_id = self.id, page_id, error = %e, "remove compacted page failed");
            }
        }
        debug!(delta_id = self.id, merged = obsolete_pages.len(), "delta compacted");
        Ok(true)
    }

    pub fn to_meta(&self) -> DeltaMeta {
        let st = self.state.read();
        DeltaMeta { files: st.persisted.iter().filter_map(|f| f.descriptor()).collect() }
    }

    pub fn restore(ctx: &DMContext, id: PageId, meta: &DeltaMeta) -> Result<Self> {
        let files = meta.files.iter()
            .map(|d| ColumnFile::restore(ctx, d).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_files(id, files, Vec::new()))
    }
}

/// 删除快照中 tiny 文件占用的页；这些文件已被新 segment 取代
pub(crate) fn release_pages(ctx: &DMContext, snap: &DeltaSnapshot) {
    for f in snap.files() {
        if let ColumnFileKind::Tiny { page_id, .. } = &f.kind {
            if let Err(e) = ctx.storage_pool.log.remove(*page_id) {
                warn!(page_id, error = %e, "release delta page failed");
            }
        }
    }
}
