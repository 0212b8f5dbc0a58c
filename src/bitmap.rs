//! 行可见性位图
//!
//! 位置编号：先是 stable 各文件按顺序拼接的行，其后是 delta 的行。
//! MVCC 结束后为 1 的位置就是最终输出的行。

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapFilter {
    bits: Vec<bool>,
    /// 整个位图都为 1（skip 读可直接整段输出）
    all_match: bool,
}

impl BitmapFilter {
    pub fn new(size: usize, default_value: bool) -> Self {
        Self { bits: vec![default_value; size], all_match: default_value }
    }

    pub fn set(&mut self, pos: usize, value: bool) {
        if let Some(b) = self.bits.get_mut(pos) {
            *b = value;
            self.all_match &= value;
        }
    }

    pub fn set_range(&mut self, start: usize, limit: usize, value: bool) {
        let end = (start + limit).min(self.bits.len());
        if start >= end {
            return;
        }
        self.bits[start..end].fill(value);
        self.all_match &= value;
    }

    pub fn get(&self, pos: usize) -> bool {
        self.bits.get(pos).copied().unwrap_or(false)
    }

    /// `[start, start+limit)` 中是否全部为 1
    pub fn is_range_all(&self, start: usize, limit: usize) -> bool {
        let end = (start + limit).min(self.bits.len());
        self.bits[start.min(end)..end].iter().all(|&b| b)
    }

    pub fn count(&self) -> usize { self.bits.iter().filter(|&&b| b).count() }
    pub fn size(&self)  -> usize { self.bits.len() }
    pub fn is_all_match(&self) -> bool { self.all_match && !self.bits.is_empty() }

    /// 重新计算 all_match 标记
    pub fn run_optimize(&mut self) {
        self.all_match = self.bits.iter().all(|&b| b);
    }

    pub fn and(&mut self, other: &BitmapFilter) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a &= *b;
        }
        self.run_optimize();
    }

    pub fn or(&mut self, other: &BitmapFilter) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        self.run_optimize();
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i)
    }
}
