//! DMFile 回收
//!
//! 一个 DMFile 可能同时被多个 segment 引用（逻辑 split 共享 stable 文件、
//! ingest 进 delta 的 Big 文件），也可能在 segment 被取代之后仍被旧快照读取。
//! 这里按文件 id 记录映射中 segment 的引用次数，并记下见过的每个 `Arc<DMFile>`。
//! 引用归零且所有 `Arc` 都已释放的文件才会被删除，同时清掉它的 min-max 索引缓存。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::FileId;
use crate::dm_context::DMContext;
use crate::dmfile::DMFile;

struct Tracked {
    refs:    usize,
    path:    String,
    handles: Vec<Weak<DMFile>>,
}

impl Tracked {
    fn remember(&mut self, file: &Arc<DMFile>) {
        self.handles.retain(|w| w.strong_count() > 0);
        if !self.handles.iter().any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(file))) {
            self.handles.push(Arc::downgrade(file));
        }
    }

    fn is_garbage(&self) -> bool {
        self.refs == 0 && self.handles.iter().all(|w| w.strong_count() == 0)
    }
}

#[derive(Default)]
pub struct DMFileGc {
    files: Mutex<HashMap<FileId, Tracked>>,
}

impl DMFileGc {
    pub fn new() -> Self { Self::default() }

    /// 每出现一次记一次引用
    pub fn acquire(&self, files: &[Arc<DMFile>]) {
        let mut map = self.files.lock();
        for f in files {
            let t = map.entry(f.id()).or_insert_with(|| Tracked {
                refs:    0,
                path:    f.path().to_string(),
                handles: Vec::new(),
            });
            t.refs += 1;
            t.remember(f);
        }
    }

    pub fn release(&self, files: &[Arc<DMFile>]) {
        let mut map = self.files.lock();
        for f in files {
            match map.get_mut(&f.id()) {
                Some(t) => {
                    t.refs = t.refs.saturating_sub(1);
                    t.remember(f);
                }
                None => warn!(file_id = f.id(), "release of untracked dmfile"),
            }
        }
    }

    pub fn refs(&self, file_id: FileId) -> usize {
        self.files.lock().get(&file_id).map_or(0, |t| t.refs)
    }

    /// 引用已归零、等待最后一个持有者释放的文件数
    pub fn pending(&self) -> usize {
        self.files.lock().values().filter(|t| t.refs == 0).count()
    }

    /// 删除可以回收的文件，返回删除的个数。删除失败时只记日志。
    pub fn sweep(&self, ctx: &DMContext) -> usize {
        let garbage: Vec<(FileId, String)> = {
            let mut map = self.files.lock();
            let ids: Vec<FileId> = map.iter().filter(|(_, t)| t.is_garbage()).map(|(id, _)| *id).collect();
            ids.into_iter()
                .filter_map(|id| map.remove(&id).map(|t| (id, t.path)))
                .collect()
        };
        let mut removed = 0;
        for (file_id, path) in garbage {
            if let Err(e) = ctx.io.provider.remove(&path) {
                warn!(tracing_id = %ctx.tracing_id, file_id, error = %e, "remove dmfile failed");
                continue;
            }
            if let Some(cache) = &ctx.index_cache {
                cache.remove_file(file_id);
            }
            removed += 1;
        }
        if removed > 0 {
            debug!(tracing_id = %ctx.tracing_id, removed, pending = self.pending(), "dmfiles collected");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, Row};
    use crate::compression::CompressionMethod;
    use crate::config::DmConfig;
    use crate::dmfile::DMFileWriter;
    use crate::field_type::{ColumnDefine, FieldType, Value};

    fn file(ctx: &DMContext, id: FileId) -> Arc<DMFile> {
        let rows = (0..4).map(|h| Row::new_int(h, 1, vec![Value::Int64(h)])).collect();
        let mut w = DMFileWriter::new(id, &ctx.config.dmfile_dir, &ctx.columns, false, 2, CompressionMethod::Lz4);
        w.write(&Block::new(rows)).unwrap();
        w.finalize(&ctx.io).unwrap()
    }

    #[test]
    fn file_outlives_last_reader() {
        let cols = vec![ColumnDefine::new(1, "v", FieldType::Int64)];
        let ctx = DMContext::in_memory(DmConfig::default(), cols, false).unwrap();
        let gc = DMFileGc::new();
        let f = file(&ctx, 7);
        gc.acquire(&[f.clone(), f.clone()]);
        gc.release(&[f.clone()]);
        assert_eq!(gc.refs(7), 1);
        assert_eq!(gc.sweep(&ctx), 0);

        gc.release(&[f.clone()]);
        assert_eq!(gc.pending(), 1);
        // 仍有读者持有
        assert_eq!(gc.sweep(&ctx), 0);
        assert!(ctx.io.provider.size(f.path()).is_ok());

        let path = f.path().to_string();
        drop(f);
        assert_eq!(gc.sweep(&ctx), 1);
        assert!(ctx.io.provider.size(&path).is_err());
        assert_eq!(gc.pending(), 0);
    }
}
