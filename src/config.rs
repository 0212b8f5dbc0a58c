//! 存储引擎配置

use crate::common::{DmError, Result};
use crate::compression::CompressionMethod;

/// DeltaMerge 存储核心的可调参数
#[derive(Debug, Clone)]
pub struct DmConfig {
    /// stable 文件中每个 pack 的目标行数
    pub pack_rows:                    usize,
    /// mem table 超过该行数后建议 flush
    pub delta_cache_limit_rows:       usize,
    /// 行数低于该值的 tiny 文件参与 compact
    pub delta_small_column_file_rows: usize,
    /// 超过该行数的 segment 建议 split
    pub segment_limit_rows:           usize,
    pub enable_logical_split:         bool,
    /// 对 MVCC 干净的 pack 跳过 handle/version 列读取
    pub enable_skip_read:             bool,
    pub enable_rough_set_filter:      bool,
    pub minmax_index_cache_capacity:  usize,
    pub table_range_cache_capacity:   usize,
    /// DMFile 在 FileProvider 中的目录前缀
    pub dmfile_dir:                   String,
    /// split / merge / merge_delta 后重新核对行数
    pub check_structural_invariants:  bool,
    pub compression:                  CompressionMethod,
}

impl Default for DmConfig {
    fn default() -> Self {
        Self {
            pack_rows:                    8192,
            delta_cache_limit_rows:       4096,
            delta_small_column_file_rows: 2048,
            segment_limit_rows:           1_000_000,
            enable_logical_split:         false,
            enable_skip_read:             true,
            enable_rough_set_filter:      true,
            minmax_index_cache_capacity:  1024,
            table_range_cache_capacity:   256,
            dmfile_dir:                   "dmf".into(),
            check_structural_invariants:  true,
            compression:                  CompressionMethod::Lz4,
        }
    }
}

impl DmConfig {
    pub fn with_pack_rows(mut self, rows: usize) -> Self {
        self.pack_rows = rows; self
    }
    pub fn with_delta_cache_limit_rows(mut self, rows: usize) -> Self {
        self.delta_cache_limit_rows = rows; self
    }
    pub fn with_delta_small_column_file_rows(mut self, rows: usize) -> Self {
        self.delta_small_column_file_rows = rows; self
    }
    pub fn with_segment_limit_rows(mut self, rows: usize) -> Self {
        self.segment_limit_rows = rows; self
    }
    pub fn with_logical_split(mut self, enable: bool) -> Self {
        self.enable_logical_split = enable; self
    }
    pub fn with_skip_read(mut self, enable: bool) -> Self {
        self.enable_skip_read = enable; self
    }
    pub fn with_rough_set_filter(mut self, enable: bool) -> Self {
        self.enable_rough_set_filter = enable; self
    }
    pub fn with_minmax_index_cache_capacity(mut self, cap: usize) -> Self {
        self.minmax_index_cache_capacity = cap; self
    }
    pub fn with_dmfile_dir(mut self, dir: &str) -> Self {
        self.dmfile_dir = dir.into(); self
    }
    pub fn with_structural_checks(mut self, enable: bool) -> Self {
        self.check_structural_invariants = enable; self
    }
    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method; self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pack_rows == 0 {
            return Err(DmError::InvalidConfig("pack_rows must be positive".into()));
        }
        if self.table_range_cache_capacity == 0 {
            return Err(DmError::InvalidConfig(
                "table_range_cache_capacity must be positive".into(),
            ));
        }
        if self.dmfile_dir.is_empty() {
            return Err(DmError::InvalidConfig("dmfile_dir must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DmConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_pack_rows_rejected() {
        let cfg = DmConfig::default().with_pack_rows(0);
        assert!(matches!(cfg.validate(), Err(DmError::InvalidConfig(_))));
    }
}
