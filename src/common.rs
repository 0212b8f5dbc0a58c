//! 全局基础类型与错误定义

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

pub type SegmentId = u64;
pub type PageId    = u64;
pub type FileId    = u64;
pub type ColId     = i64;
/// MVCC 版本号（写入时间戳）
pub type Timestamp = u64;

// ── 保留列 ────────────────────────────────────────────────────────────────────

/// 主键（handle）列
pub const EXTRA_HANDLE_COLUMN_ID: ColId = -1;
/// 版本列
pub const VERSION_COLUMN_ID: ColId      = -1024;
/// 删除标记列
pub const TAG_COLUMN_ID: ColId          = -1025;

pub fn is_reserved_column(col_id: ColId) -> bool {
    matches!(col_id, EXTRA_HANDLE_COLUMN_ID | VERSION_COLUMN_ID | TAG_COLUMN_ID)
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DmError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data corruption: {0}")]
    Corruption(String),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    /// 分区不变量被破坏（区间空洞/重叠、行数不守恒等），不可恢复
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("scan cancelled")]
    Cancelled,
    #[error("page not found: page_id={0}")]
    PageNotFound(PageId),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("rows not sorted: {0}")]
    Unsorted(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("segment not found: segment_id={0}")]
    SegmentNotFound(SegmentId),
}

pub type Result<T> = std::result::Result<T, DmError>;

/// 将 std::io 错误以外的底层失败统一包装为 Corruption
pub(crate) fn corruption(msg: impl Into<String>) -> DmError {
    DmError::Corruption(msg.into())
}
