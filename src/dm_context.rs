//! 一次存储操作的上下文
//!
//! segment 的读写与结构变更都通过 `DMContext` 拿到配置、存储池、文件访问、
//! 索引缓存和扫描统计，不依赖任何进程级单例。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::Result;
use crate::config::DmConfig;
use crate::field_type::ColumnDefine;
use crate::file_gc::DMFileGc;
use crate::index::MinMaxIndexCache;
use crate::io::FileIo;
use crate::rowkey::{RowKeyRange, TableRangeMinMaxCache};
use crate::scan_context::ScanContext;
use crate::storage_pool::StoragePool;

pub struct DMContext {
    pub config:             DmConfig,
    pub storage_pool:       Arc<StoragePool>,
    pub io:                 FileIo,
    pub index_cache:        Option<Arc<MinMaxIndexCache>>,
    pub scan_context:       Arc<ScanContext>,
    pub table_range_cache:  Arc<TableRangeMinMaxCache>,
    pub file_gc:            Arc<DMFileGc>,
    /// 附加在日志上，用来串起同一请求的所有日志
    pub tracing_id:         String,
    /// 表的用户列（不含 handle / version / tag）
    pub columns:            Vec<ColumnDefine>,
    pub is_common_handle:   bool,
    pub rowkey_column_size: usize,
    epoch:                  Arc<AtomicU64>,
}

impl DMContext {
    pub fn new(
        config:       DmConfig,
        storage_pool: Arc<StoragePool>,
        io:           FileIo,
        columns:      Vec<ColumnDefine>,
        is_common_handle: bool,
    ) -> Result<Self> {
        config.validate()?;
        let index_cache = (config.minmax_index_cache_capacity > 0)
            .then(|| Arc::new(MinMaxIndexCache::new(config.minmax_index_cache_capacity)));
        let table_range_cache = Arc::new(TableRangeMinMaxCache::new(config.table_range_cache_capacity));
        Ok(Self {
            config,
            storage_pool,
            io,
            index_cache,
            scan_context: Arc::new(ScanContext::new()),
            table_range_cache,
            file_gc: Arc::new(DMFileGc::new()),
            tracing_id: String::new(),
            columns,
            is_common_handle,
            rowkey_column_size: 1,
            epoch: Arc::new(AtomicU64::new(1)),
        })
    }

    /// 全内存的上下文（内存页存储 + 内存文件）
    pub fn in_memory(config: DmConfig, columns: Vec<ColumnDefine>, is_common_handle: bool) -> Result<Self> {
        Self::new(config, Arc::new(StoragePool::in_memory()), FileIo::in_memory(), columns, is_common_handle)
    }

    pub fn with_tracing_id(mut self, id: impl Into<String>) -> Self {
        self.tracing_id = id.into();
        self
    }

    pub fn with_rowkey_column_size(mut self, size: usize) -> Self {
        self.rowkey_column_size = size;
        self
    }

    /// 共享存储与缓存，换一个新的扫描统计（每个查询一份）
    pub fn for_query(&self, tracing_id: impl Into<String>) -> Self {
        Self {
            config:             self.config.clone(),
            storage_pool:       self.storage_pool.clone(),
            io:                 self.io.clone(),
            index_cache:        self.index_cache.clone(),
            scan_context:       Arc::new(ScanContext::new()),
            table_range_cache:  self.table_range_cache.clone(),
            file_gc:            self.file_gc.clone(),
            tracing_id:         tracing_id.into(),
            columns:            self.columns.clone(),
            is_common_handle:   self.is_common_handle,
            rowkey_column_size: self.rowkey_column_size,
            epoch:              self.epoch.clone(),
        }
    }

    /// segment 每次换代（新建、split、merge、替换层）都取一个新 epoch
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// 恢复已持久化的 segment 后，保证之后分配的 epoch 大于 `epoch`
    pub fn observe_epoch(&self, epoch: u64) {
        self.epoch.fetch_max(epoch + 1, Ordering::Relaxed);
    }

    pub fn full_range(&self) -> RowKeyRange {
        RowKeyRange::new_all(self.is_common_handle, self.rowkey_column_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_context_shares_epoch_but_not_counters() {
        let ctx = DMContext::in_memory(DmConfig::default(), vec![], false).unwrap();
        let q = ctx.for_query("q1");
        let a = ctx.next_epoch();
        let b = q.next_epoch();
        assert!(b > a);
        ScanContext::add(&q.scan_context.num_segments, 1);
        assert_eq!(ScanContext::get(&ctx.scan_context.num_segments), 0);
        assert!(ctx.full_range().all());
    }

    #[test]
    fn invalid_config_rejected() {
        assert!(DMContext::in_memory(DmConfig::default().with_pack_rows(0), vec![], false).is_err());
    }
}
