//! 每个查询一份的扫描统计与协作式取消标记
//!
//! 各组件只累加计数，从不依据计数做控制决策；唯一被读取用于控制的是取消标记，
//! 读路径在每个 pack / block 边界调用 `check_cancelled`。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::common::{DmError, Result};

macro_rules! scan_counters {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub struct ScanContext {
            $(pub $name: AtomicU64,)*
            cancelled: AtomicBool,
        }

        impl ScanContext {
            /// 合并另一个 context 的计数（用于汇总多个读任务）
            pub fn merge(&self, other: &ScanContext) {
                $(self.$name.fetch_add(other.$name.load(Ordering::Relaxed), Ordering::Relaxed);)*
            }
        }

        impl fmt::Display for ScanContext {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fields: Vec<String> = vec![
                    $(format!("\"{}\":{}", stringify!($name), self.$name.load(Ordering::Relaxed)),)*
                ];
                write!(f, "{{{}}}", fields.join(","))
            }
        }
    };
}

scan_counters!(
    dmfile_data_scanned_rows,
    dmfile_data_skipped_rows,
    dmfile_mvcc_scanned_rows,
    dmfile_mvcc_skipped_rows,
    dmfile_lm_filter_scanned_rows,
    dmfile_lm_filter_skipped_rows,
    total_dmfile_read_time_ns,
    rs_pack_filter_none,
    rs_pack_filter_some,
    rs_pack_filter_all,
    total_rs_pack_filter_check_time_ns,
    total_dmfile_rough_set_index_check_time_ns,
    mvcc_input_rows,
    mvcc_input_bytes,
    mvcc_output_rows,
    delta_rows,
    delta_bytes,
    index_cache_hits,
    index_cache_misses,
    num_segments,
    num_read_tasks,
    num_stale_read,
);

impl ScanContext {
    pub fn new() -> Self { Self::default() }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() { Err(DmError::Cancelled) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_counters() {
        let a = ScanContext::new();
        let b = ScanContext::new();
        ScanContext::add(&a.rs_pack_filter_none, 3);
        ScanContext::add(&b.rs_pack_filter_none, 4);
        ScanContext::add(&b.delta_rows, 10);
        a.merge(&b);
        assert_eq!(ScanContext::get(&a.rs_pack_filter_none), 7);
        assert_eq!(ScanContext::get(&a.delta_rows), 10);
        assert!(a.to_string().contains("\"rs_pack_filter_none\":7"));
    }

    #[test]
    fn cancellation_is_observed() {
        let ctx = ScanContext::new();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(DmError::Cancelled)));
    }
}
