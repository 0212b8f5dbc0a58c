//! # dm-storage-engine
//!
//! 按 rowkey 区间划分、带 MVCC 版本的 DeltaMerge 列存储核心：
//! - **rowkey**：行键与半开区间，所有划分与比较的基础
//! - **pack 过滤**：只看 min-max 索引判断 stable 文件的哪些 pack 可以跳过
//! - **segment 生命周期**：split / merge / merge_delta / replace
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      SegmentStore                        │
//! │   BTreeMap<range end, Segment>   check_partition()       │
//! │        │                                                 │
//! │     Segment  [start, end)  id / epoch / next_segment_id  │
//! │   ┌────┴─────────────────┐                               │
//! │ DeltaValueSpace     StableValueSpace                     │
//! │   ├─ InMemory          └─ DMFile × N                     │
//! │   ├─ Tiny  (log 页)         ├─ pack × M (LZ4 列块)         │
//! │   ├─ DeleteRange            ├─ PackStat                  │
//! │   └─ Big   (DMFile 引用)     └─ MinMaxIndex × 列          │
//! │                                   │                      │
//! │              DMFilePackFilter ────┘                      │
//! │                ├─ RSOperator::rough_check → RSResult     │
//! │                ├─ MinMaxIndexCache (LRU)                 │
//! │                └─ skip range → BitmapFilter → MVCC       │
//! └──────────────────────────────────────────────────────────┘
//!         DMContext: 配置 / StoragePool / FileIo / ScanContext
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod field_type;
pub mod codec;
pub mod compression;
pub mod rowkey;

// ── pack 过滤 ─────────────────────────────────────────────────────────────────
pub mod index;
pub mod filter;
pub mod scan_context;
pub mod pack_filter;
pub mod bitmap;

// ── 存储 ──────────────────────────────────────────────────────────────────────
pub mod io;
pub mod storage_pool;
pub mod block;
pub mod dmfile;
pub mod file_gc;
pub mod meta;
pub mod delta;
pub mod stable;
pub mod dm_context;
pub mod segment;
pub mod store;

pub use common::{DmError, Result};
pub use config::DmConfig;
pub use dm_context::DMContext;
pub use filter::{RSOperator, RSResult};
pub use rowkey::{RowKeyRange, RowKeyValue};
pub use segment::{Segment, SegmentSnapshot, SegmentState, SplitMode};
pub use store::SegmentStore;
