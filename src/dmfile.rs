//! DMFile：stable 层的列存文件
//!
//! 行按 (handle, version) 有序写入，每 `pack_rows` 行切成一个 pack。
//! 每列每个 pack 一个压缩块；每列一个 min-max 索引。
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "DMFILE\0\0"     │
//! │  Version(4 bytes) = 1              │
//! ├────────────────────────────────────┤
//! │  DATA REGION（pack 优先）            │
//! │    pack 0: [handle][version][tag]  │ ← encode_values + LZ4
//! │            [col 1] ... [col N]     │
//! │    pack 1: ...                     │
//! ├────────────────────────────────────┤
//! │  INDEX REGION                      │
//! │    [MinMaxIndex col 0..N]          │
//! ├────────────────────────────────────┤
//! │  FOOTER                            │
//! │    DMFileFooter                    │
//! │    Footer CRC32  (4 bytes)         │
//! │    Footer length (4 bytes)         │
//! │    MAGIC         (8 bytes)         │
//! └────────────────────────────────────┘
//! ```

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::block::{Block, Row};
use crate::codec::{decode_values, encode_values, read_bytes, read_count, read_varint, write_bytes, write_varint};
use crate::common::{
    corruption, ColId, DmError, FileId, Result, Timestamp,
    EXTRA_HANDLE_COLUMN_ID, TAG_COLUMN_ID, VERSION_COLUMN_ID,
};
use crate::compression::{compress, decompress, CompressionMethod};
use crate::field_type::{ColumnDefine, FieldType, Value};
use crate::index::MinMaxIndex;
use crate::io::FileIo;
use crate::rowkey::{RowKeyRange, RowKeyValue};

const MAGIC: &[u8; 8] = b"DMFILE\0\0";
const VERSION: u32     = 1;
const HEADER_SIZE: u64 = 12;
const TAIL_SIZE: u64   = 16;

/// 物理列：handle / version / tag 之后是用户列
const RESERVED_COLUMNS: usize = 3;

fn stored_columns(user_columns: &[ColumnDefine]) -> Vec<ColumnDefine> {
    let mut cols = vec![
        ColumnDefine::new(EXTRA_HANDLE_COLUMN_ID, "_tidb_rowid", FieldType::Bytes),
        ColumnDefine::new(VERSION_COLUMN_ID, "_INTERNAL_VERSION", FieldType::UInt64),
        ColumnDefine::new(TAG_COLUMN_ID, "_INTERNAL_DELMARK", FieldType::Int8),
    ];
    cols.extend_from_slice(user_columns);
    cols
}

pub fn dmfile_path(dir: &str, id: FileId) -> String {
    format!("{dir}/dmf_{id}")
}

// ── Footer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockLoc {
    offset: u64,
    size:   u64,
}

/// 单个 pack 的统计
#[derive(Debug, Clone, PartialEq)]
pub struct PackStat {
    pub rows:          usize,
    /// 已删除行，以及与相邻行（可跨 pack）handle 重复的行
    pub not_clean:     usize,
    pub first_version: Timestamp,
    pub max_version:   Timestamp,
    /// 磁盘上该 pack 所有列块的总字节数
    pub bytes:         u64,
    pub first_handle:  RowKeyValue,
    pub last_handle:   RowKeyValue,
}

impl PackStat {
    /// pack 覆盖的 handle 区间 `[first, last.to_next())`
    pub fn handle_range(&self, rowkey_column_size: usize) -> RowKeyRange {
        RowKeyRange::new(
            self.first_handle.clone(),
            self.last_handle.to_next(),
            self.first_handle.is_common_handle(),
            rowkey_column_size,
        )
    }
}

#[derive(Debug, Clone)]
struct DMFileFooter {
    is_common_handle: bool,
    columns:          Vec<ColumnDefine>,
    pack_stats:       Vec<PackStat>,
    /// [pack][stored column]
    block_locs:       Vec<Vec<BlockLoc>>,
    /// [stored column]
    index_locs:       Vec<BlockLoc>,
}

fn write_loc(out: &mut Vec<u8>, loc: BlockLoc) {
    write_varint(out, loc.offset);
    write_varint(out, loc.size);
}

fn read_loc(cur: &mut Cursor<&[u8]>) -> Result<BlockLoc> {
    Ok(BlockLoc { offset: read_varint(cur)?, size: read_varint(cur)? })
}

impl DMFileFooter {
    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.push(self.is_common_handle as u8);
        write_varint(&mut out, self.columns.len() as u64);
        for c in &self.columns {
            out.write_i64::<LittleEndian>(c.id)?;
            out.push(c.field_type.tag());
            write_bytes(&mut out, c.name.as_bytes());
        }
        write_varint(&mut out, self.pack_stats.len() as u64);
        for (stat, locs) in self.pack_stats.iter().zip(&self.block_locs) {
            write_varint(&mut out, stat.rows as u64);
            write_varint(&mut out, stat.not_clean as u64);
            write_varint(&mut out, stat.first_version);
            write_varint(&mut out, stat.max_version);
            write_varint(&mut out, stat.bytes);
            write_bytes(&mut out, stat.first_handle.as_bytes());
            write_bytes(&mut out, stat.last_handle.as_bytes());
            for loc in locs {
                write_loc(&mut out, *loc);
            }
        }
        for loc in &self.index_locs {
            write_loc(&mut out, *loc);
        }
        Ok(out)
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let is_common_handle = cur.read_u8()? != 0;
        let ncols = read_count(&mut cur, 10, "dmfile column")?;
        let mut columns = Vec::with_capacity(ncols);
        for _ in 0..ncols {
            let id  = cur.read_i64::<LittleEndian>()?;
            let tag = cur.read_u8()?;
            let field_type = FieldType::from_tag(tag)
                .ok_or_else(|| corruption(format!("unknown field type tag {tag}")))?;
            let name = String::from_utf8(read_bytes(&mut cur)?)
                .map_err(|e| DmError::Encoding(e.to_string()))?;
            columns.push(ColumnDefine { id, name, field_type });
        }
        let npacks = read_count(&mut cur, 7, "dmfile pack")?;
        let mut pack_stats = Vec::with_capacity(npacks);
        let mut block_locs = Vec::with_capacity(npacks);
        for _ in 0..npacks {
            let rows          = read_varint(&mut cur)? as usize;
            let not_clean     = read_varint(&mut cur)? as usize;
            let first_version = read_varint(&mut cur)?;
            let max_version   = read_varint(&mut cur)?;
            let bytes         = read_varint(&mut cur)?;
            let first_handle  = RowKeyValue::from_handle(is_common_handle, &read_bytes(&mut cur)?);
            let last_handle   = RowKeyValue::from_handle(is_common_handle, &read_bytes(&mut cur)?);
            pack_stats.push(PackStat {
                rows, not_clean, first_version, max_version, bytes, first_handle, last_handle,
            });
            let locs = (0..ncols).map(|_| read_loc(&mut cur)).collect::<Result<Vec<_>>>()?;
            block_locs.push(locs);
        }
        let index_locs = (0..ncols).map(|_| read_loc(&mut cur)).collect::<Result<Vec<_>>>()?;
        Ok(Self { is_common_handle, columns, pack_stats, block_locs, index_locs })
    }
}

// ── DMFileWriter ──────────────────────────────────────────────────────────────

pub struct DMFileWriter {
    id:               FileId,
    path:             String,
    columns:          Vec<ColumnDefine>,
    is_common_handle: bool,
    pack_rows:        usize,
    compression:      CompressionMethod,
    rows:             Vec<Row>,
}

impl DMFileWriter {
    pub fn new(
        id:               FileId,
        dir:              &str,
        columns:          &[ColumnDefine],
        is_common_handle: bool,
        pack_rows:        usize,
        compression:      CompressionMethod,
    ) -> Self {
        Self {
            id,
            path: dmfile_path(dir, id),
            columns: columns.to_vec(),
            is_common_handle,
            pack_rows: pack_rows.max(1),
            compression,
            rows: Vec::new(),
        }
    }

    /// 追加一个有序块；与已写入的最后一行也必须保持有序
    pub fn write(&mut self, block: &Block) -> Result<()> {
        block.check_schema(&self.columns)?;
        block.ensure_sorted()?;
        if let (Some(last), Some(first)) = (self.rows.last(), block.rows.first()) {
            if last.cmp_key(first) == std::cmp::Ordering::Greater {
                return Err(DmError::Unsorted(format!(
                    "block starts at {:?} but file already ends at {:?}", first.handle, last.handle
                )));
            }
        }
        self.rows.extend(block.rows.iter().cloned());
        Ok(())
    }

    fn column_value(row: &Row, stored_idx: usize) -> Value {
        match stored_idx {
            0 => Value::Bytes(row.handle.as_bytes().to_vec()),
            1 => Value::UInt64(row.version),
            2 => Value::Int8(row.deleted as i8),
            i => row.values.get(i - RESERVED_COLUMNS).cloned().unwrap_or(Value::Null),
        }
    }

    /// 写出整个文件并返回其句柄
    pub fn finalize(self, io: &FileIo) -> Result<Arc<DMFile>> {
        let stored = stored_columns(&self.columns);
        let rows = &self.rows;
        let n = rows.len();

        let mut out = Vec::with_capacity(n * 32 + 256);
        out.extend_from_slice(MAGIC);
        out.write_u32::<LittleEndian>(VERSION)?;

        // 删除行与重复 handle 行都不能走 skip 读
        let dirty: Vec<bool> = (0..n)
            .map(|i| {
                rows[i].deleted
                    || (i > 0 && rows[i - 1].handle == rows[i].handle)
                    || (i + 1 < n && rows[i + 1].handle == rows[i].handle)
            })
            .collect();

        // ── DATA REGION ───────────────────────────────────────────────────────
        let mut indexes: Vec<MinMaxIndex> = stored.iter().map(|c| MinMaxIndex::new(c.field_type)).collect();
        let mut pack_stats = Vec::new();
        let mut block_locs = Vec::new();

        for (pack_idx, chunk) in rows.chunks(self.pack_rows).enumerate() {
            let base = pack_idx * self.pack_rows;
            let mut locs = Vec::with_capacity(stored.len());
            let mut pack_bytes = 0u64;
            for (ci, index) in indexes.iter_mut().enumerate() {
                let values: Vec<Value> = chunk.iter().map(|r| Self::column_value(r, ci)).collect();
                index.add_pack(&values);
                let data = compress(&encode_values(&values)?, self.compression)?;
                locs.push(BlockLoc { offset: out.len() as u64, size: data.len() as u64 });
                pack_bytes += data.len() as u64;
                out.extend_from_slice(&data);
            }
            let (first, last) = match (chunk.first(), chunk.last()) {
                (Some(f), Some(l)) => (f, l),
                _ => continue,
            };
            pack_stats.push(PackStat {
                rows:          chunk.len(),
                not_clean:     dirty[base..base + chunk.len()].iter().filter(|&&d| d).count(),
                first_version: chunk.iter().map(|r| r.version).min().unwrap_or(0),
                max_version:   chunk.iter().map(|r| r.version).max().unwrap_or(0),
                bytes:         pack_bytes,
                first_handle:  first.handle.clone(),
                last_handle:   last.handle.clone(),
            });
            block_locs.push(locs);
        }

        // ── INDEX REGION ──────────────────────────────────────────────────────
        let mut index_locs = Vec::with_capacity(stored.len());
        for index in &indexes {
            let data = index.serialize()?;
            index_locs.push(BlockLoc { offset: out.len() as u64, size: data.len() as u64 });
            out.extend_from_slice(&data);
        }

        // ── FOOTER ────────────────────────────────────────────────────────────
        let footer = DMFileFooter {
            is_common_handle: self.is_common_handle,
            columns: stored,
            pack_stats,
            block_locs,
            index_locs,
        };
        let footer_bytes = footer.serialize()?;
        out.extend_from_slice(&footer_bytes);
        out.write_u32::<LittleEndian>(crc32fast::hash(&footer_bytes))?;
        out.write_u32::<LittleEndian>(footer_bytes.len() as u32)?;
        out.extend_from_slice(MAGIC);

        io.write_file(&self.path, &out)?;
        debug!(file_id = self.id, rows = n, packs = footer.pack_stats.len(), bytes = out.len(), "dmfile written");

        Ok(Arc::new(DMFile {
            id:           self.id,
            path:         self.path,
            meta_version: 0,
            bytes:        out.len() as u64,
            footer,
        }))
    }
}

// ── DMFile ────────────────────────────────────────────────────────────────────

/// 已封存的 stable 文件。内容不可变，`meta_version` 只在元数据替换时递增。
#[derive(Debug, Clone)]
pub struct DMFile {
    id:           FileId,
    path:         String,
    meta_version: u64,
    bytes:        u64,
    footer:       DMFileFooter,
}

impl DMFile {
    pub fn open(io: &FileIo, id: FileId, path: &str) -> Result<Self> {
        let size = io.provider.size(path)?;
        if size < HEADER_SIZE + TAIL_SIZE {
            return Err(corruption(format!("dmfile {path} too short: {size} bytes")));
        }
        let head = io.read_range(path, 0, HEADER_SIZE as usize)?;
        if &head[..8] != MAGIC || LittleEndian::read_u32(&head[8..12]) != VERSION {
            return Err(corruption(format!("dmfile {path} has invalid header")));
        }
        let tail = io.read_range(path, size - TAIL_SIZE, TAIL_SIZE as usize)?;
        if &tail[8..16] != MAGIC {
            return Err(corruption(format!("dmfile {path} has invalid magic")));
        }
        let footer_crc = LittleEndian::read_u32(&tail[0..4]);
        let footer_len = LittleEndian::read_u32(&tail[4..8]) as u64;
        if footer_len + HEADER_SIZE + TAIL_SIZE > size {
            return Err(corruption(format!("dmfile {path} footer length {footer_len} out of range")));
        }
        let footer_bytes = io.read_range(path, size - TAIL_SIZE - footer_len, footer_len as usize)?;
        if crc32fast::hash(&footer_bytes) != footer_crc {
            return Err(DmError::ChecksumMismatch(format!("dmfile {path} footer")));
        }
        let footer = DMFileFooter::deserialize(&footer_bytes)?;
        Ok(Self { id, path: path.into(), meta_version: 0, bytes: size, footer })
    }

    pub fn id(&self)           -> FileId { self.id }
    pub fn path(&self)         -> &str   { &self.path }
    pub fn meta_version(&self) -> u64    { self.meta_version }
    pub fn bytes(&self)        -> u64    { self.bytes }
    pub fn pack_stats(&self)   -> &[PackStat] { &self.footer.pack_stats }
    pub fn pack_count(&self)   -> usize  { self.footer.pack_stats.len() }
    pub fn is_common_handle(&self) -> bool { self.footer.is_common_handle }

    pub fn rows(&self) -> usize {
        self.footer.pack_stats.iter().map(|p| p.rows).sum()
    }

    /// 用户列定义（不含 handle / version / tag）
    pub fn columns(&self) -> &[ColumnDefine] {
        &self.footer.columns[RESERVED_COLUMNS..]
    }

    pub fn with_meta_version(&self, meta_version: u64) -> DMFile {
        Self { meta_version, ..self.clone() }
    }

    /// 每个 pack 第一行在文件中的行号
    pub fn pack_offsets(&self) -> Vec<usize> {
        self.footer.pack_stats.iter()
            .scan(0usize, |acc, p| { let start = *acc; *acc += p.rows; Some(start) })
            .collect()
    }

    fn stored_index(&self, col_id: ColId) -> Option<usize> {
        self.footer.columns.iter().position(|c| c.id == col_id)
    }

    pub fn column_type(&self, col_id: ColId) -> Option<FieldType> {
        self.stored_index(col_id).map(|i| self.footer.columns[i].field_type)
    }

    fn read_block(&self, io: &FileIo, pack_id: usize, stored_idx: usize) -> Result<Vec<Value>> {
        let loc = self.footer.block_locs.get(pack_id)
            .and_then(|locs| locs.get(stored_idx))
            .ok_or_else(|| corruption(format!("dmfile {} has no block ({pack_id}, {stored_idx})", self.id)))?;
        let raw = io.read_range(&self.path, loc.offset, loc.size as usize)?;
        let values = decode_values(&decompress(&raw)?)?;
        let expect = self.footer.pack_stats[pack_id].rows;
        if values.len() != expect {
            return Err(corruption(format!(
                "dmfile {} pack {pack_id} column {stored_idx}: expect {expect} values, got {}",
                self.id, values.len()
            )));
        }
        Ok(values)
    }

    /// 读取一个 pack 的若干列
    pub fn read_pack_columns(&self, io: &FileIo, pack_id: usize, col_ids: &[ColId]) -> Result<Vec<Vec<Value>>> {
        col_ids.iter()
            .map(|&cid| {
                let idx = self.stored_index(cid)
                    .ok_or_else(|| DmError::SchemaMismatch(format!("dmfile {} has no column {cid}", self.id)))?;
                self.read_block(io, pack_id, idx)
            })
            .collect()
    }

    /// 读取一个 pack 的完整行
    pub fn read_pack_rows(&self, io: &FileIo, pack_id: usize) -> Result<Vec<Row>> {
        let is_common = self.footer.is_common_handle;
        let ncols = self.footer.columns.len();
        let mut cols: Vec<std::vec::IntoIter<Value>> = (0..ncols)
            .map(|i| self.read_block(io, pack_id, i).map(Vec::into_iter))
            .collect::<Result<_>>()?;
        let rows = self.footer.pack_stats[pack_id].rows;
        let mut out = Vec::with_capacity(rows);
        for _ in 0..rows {
            let mut next = |i: usize| cols[i].next().unwrap_or(Value::Null);
            let handle = match next(0) {
                Value::Bytes(b) => RowKeyValue::from_handle(is_common, &b),
                other => return Err(corruption(format!("handle column holds {other}"))),
            };
            let version = match next(1) {
                Value::UInt64(v) => v,
                other => return Err(corruption(format!("version column holds {other}"))),
            };
            let deleted = matches!(next(2), Value::Int8(1));
            let values: Vec<Value> = (RESERVED_COLUMNS..ncols).map(&mut next).collect();
            out.push(Row { handle, version, deleted, values });
        }
        Ok(out)
    }

    /// 读取整列的 min-max 索引；列不存在时返回 None
    pub fn load_minmax_index(&self, io: &FileIo, col_id: ColId) -> Result<Option<(FieldType, MinMaxIndex)>> {
        let Some(idx) = self.stored_index(col_id) else { return Ok(None) };
        let loc = self.footer.index_locs[idx];
        let raw = io.read_range(&self.path, loc.offset, loc.size as usize)?;
        let index = MinMaxIndex::deserialize(&raw)?;
        Ok(Some((self.footer.columns[idx].field_type, index)))
    }
}
