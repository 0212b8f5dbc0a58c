//! Segment 持久化元数据
//!
//! 一个 segment 的元数据整体存为 meta 存储中的一页（页 id = segment id）：
//!
//! ```text
//! format (u8) | segment_id | epoch | next_segment_id | range
//!             | DeltaMeta  { column file 描述 * N }
//!             | StableMeta { stable_id, DMFile 引用 * M }
//! ```
//!
//! 只有已持久化的 delta 文件（tiny / delete range / big）会写入元数据，
//! mem table 中的数据需要先 flush。

use std::io::{Cursor, Read};

use byteorder::ReadBytesExt;

use crate::codec::{read_bytes, read_varint, write_bytes, write_varint};
use crate::common::{corruption, DmError, FileId, PageId, Result, SegmentId};
use crate::rowkey::RowKeyRange;

const SEGMENT_META_FORMAT: u8 = 1;

// ── Delta ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnFileDescriptor {
    Tiny        { id: u64, range: RowKeyRange, page_id: PageId, rows: usize },
    DeleteRange { id: u64, range: RowKeyRange },
    Big         { id: u64, range: RowKeyRange, file: StableFileRef },
}

impl ColumnFileDescriptor {
    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Self::Tiny { id, range, page_id, rows } => {
                out.push(1);
                write_varint(out, *id);
                range.write_to(out);
                write_varint(out, *page_id);
                write_varint(out, *rows as u64);
            }
            Self::DeleteRange { id, range } => {
                out.push(2);
                write_varint(out, *id);
                range.write_to(out);
            }
            Self::Big { id, range, file } => {
                out.push(3);
                write_varint(out, *id);
                range.write_to(out);
                file.write_to(out);
            }
        }
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let kind  = r.read_u8()?;
        let id    = read_varint(r)?;
        let range = RowKeyRange::read_from(r)?;
        Ok(match kind {
            1 => Self::Tiny {
                id, range,
                page_id: read_varint(r)?,
                rows:    read_varint(r)? as usize,
            },
            2 => Self::DeleteRange { id, range },
            3 => Self::Big { id, range, file: StableFileRef::read_from(r)? },
            k => return Err(corruption(format!("unknown column file kind {k}"))),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaMeta {
    pub files: Vec<ColumnFileDescriptor>,
}

// ── Stable ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableFileRef {
    pub file_id:      FileId,
    pub path:         String,
    pub meta_version: u64,
}

impl StableFileRef {
    fn write_to(&self, out: &mut Vec<u8>) {
        write_varint(out, self.file_id);
        write_bytes(out, self.path.as_bytes());
        write_varint(out, self.meta_version);
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let file_id = read_varint(r)?;
        let path = String::from_utf8(read_bytes(r)?).map_err(|e| DmError::Encoding(e.to_string()))?;
        let meta_version = read_varint(r)?;
        Ok(Self { file_id, path, meta_version })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StableMeta {
    pub stable_id: PageId,
    pub files:     Vec<StableFileRef>,
}

// ── Segment ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMeta {
    pub segment_id:      SegmentId,
    pub epoch:           u64,
    /// 0 表示最后一个 segment
    pub next_segment_id: SegmentId,
    pub range:           RowKeyRange,
    pub delta:           DeltaMeta,
    pub stable:          StableMeta,
}

impl SegmentMeta {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(SEGMENT_META_FORMAT);
        write_varint(&mut out, self.segment_id);
        write_varint(&mut out, self.epoch);
        write_varint(&mut out, self.next_segment_id);
        self.range.write_to(&mut out);

        write_varint(&mut out, self.delta.files.len() as u64);
        for f in &self.delta.files {
            f.write_to(&mut out);
        }

        write_varint(&mut out, self.stable.stable_id);
        write_varint(&mut out, self.stable.files.len() as u64);
        for f in &self.stable.files {
            f.write_to(&mut out);
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let format = cur.read_u8()?;
        if format != SEGMENT_META_FORMAT {
            return Err(corruption(format!("unsupported segment meta format {format}")));
        }
        let segment_id      = read_varint(&mut cur)?;
        let epoch           = read_varint(&mut cur)?;
        let next_segment_id = read_varint(&mut cur)?;
        let range           = RowKeyRange::read_from(&mut cur)?;

        let n = read_varint(&mut cur)? as usize;
        let files = (0..n)
            .map(|_| ColumnFileDescriptor::read_from(&mut cur))
            .collect::<Result<Vec<_>>>()?;

        let stable_id = read_varint(&mut cur)?;
        let m = read_varint(&mut cur)? as usize;
        let stable_files = (0..m)
            .map(|_| StableFileRef::read_from(&mut cur))
            .collect::<Result<Vec<_>>>()?;

        if cur.position() as usize != data.len() {
            return Err(corruption(format!("trailing bytes in meta of segment {segment_id}")));
        }
        Ok(Self {
            segment_id, epoch, next_segment_id, range,
            delta:  DeltaMeta { files },
            stable: StableMeta { stable_id, files: stable_files },
        })
    }
}
