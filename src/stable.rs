//! Stable 层：一组按 (handle, version) 有序的不可变 DMFile

use std::sync::Arc;

use crate::common::{PageId, Result};
use crate::dm_context::DMContext;
use crate::dmfile::DMFile;
use crate::meta::{StableFileRef, StableMeta};
use crate::pack_filter::DMFilePackFilter;
use crate::rowkey::RowKeyRange;

#[derive(Debug, Clone)]
pub struct StableValueSpace {
    id:          PageId,
    files:       Vec<Arc<DMFile>>,
    /// segment 区间内的有效行数与字节数
    valid_rows:  usize,
    valid_bytes: u64,
}

impl StableValueSpace {
    pub fn empty(id: PageId) -> Self {
        Self { id, files: Vec::new(), valid_rows: 0, valid_bytes: 0 }
    }

    /// 以 `range` 统计有效行。属于维护操作，不写入索引缓存。
    pub fn new(ctx: &DMContext, id: PageId, range: &RowKeyRange, files: Vec<Arc<DMFile>>) -> Result<Self> {
        let (valid_rows, valid_bytes) = DMFilePackFilter::load_valid_rows_and_bytes(ctx, &files, range)?;
        Ok(Self { id, files, valid_rows, valid_bytes })
    }

    pub fn id(&self)          -> PageId        { self.id }
    pub fn files(&self)       -> &[Arc<DMFile>] { &self.files }
    pub fn valid_rows(&self)  -> usize         { self.valid_rows }
    pub fn valid_bytes(&self) -> u64           { self.valid_bytes }

    /// 文件中的全部行数，含区间外的行
    pub fn total_rows(&self) -> usize {
        self.files.iter().map(|f| f.rows()).sum()
    }

    /// 每个文件第一行在 stable 行号空间中的位置
    pub fn file_offsets(&self) -> Vec<usize> {
        self.files.iter()
            .scan(0usize, |acc, f| { let start = *acc; *acc += f.rows(); Some(start) })
            .collect()
    }

    pub fn to_meta(&self) -> StableMeta {
        StableMeta {
            stable_id: self.id,
            files: self.files.iter()
                .map(|f| StableFileRef {
                    file_id:      f.id(),
                    path:         f.path().to_string(),
                    meta_version: f.meta_version(),
                })
                .collect(),
        }
    }

    pub fn restore(ctx: &DMContext, range: &RowKeyRange, meta: &StableMeta) -> Result<Self> {
        let files = meta.files.iter()
            .map(|r| Ok(Arc::new(DMFile::open(&ctx.io, r.file_id, &r.path)?.with_meta_version(r.meta_version))))
            .collect::<Result<Vec<_>>>()?;
        Self::new(ctx, meta.stable_id, range, files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Row};
    use crate::config::DmConfig;
    use crate::dmfile::DMFileWriter;
    use crate::field_type::{ColumnDefine, FieldType, Value};

    #[test]
    fn valid_rows_follow_range() {
        let cols = vec![ColumnDefine::new(1, "v", FieldType::Int64)];
        let ctx = DMContext::in_memory(DmConfig::default(), cols, false).unwrap();
        let mut w = DMFileWriter::new(1, "dmf", &ctx.columns, false, 4, ctx.config.compression);
        w.write(&Block::new((0..10).map(|h| Row::new_int(h, 1, vec![Value::Int64(h)])).collect())).unwrap();
        let file = w.finalize(&ctx.io).unwrap();

        let range = RowKeyRange::from_handle_range(2, 7, false);
        let stable = StableValueSpace::new(&ctx, 5, &range, vec![file]).unwrap();
        assert_eq!(stable.valid_rows(), 5);
        assert_eq!(stable.total_rows(), 10);
        assert_eq!(stable.file_offsets(), vec![0]);

        let back = StableValueSpace::restore(&ctx, &range, &stable.to_meta()).unwrap();
        assert_eq!(back.valid_rows(), 5);
        assert_eq!(back.id(), 5);
    }
}
