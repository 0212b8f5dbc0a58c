//! 行与行块
//!
//! 写入、delta 层和读输出都以 `Block` 为单位。每行带有 handle、版本与删除标记，
//! 用户列值按 schema 中非保留列的顺序排列。

use std::cmp::Ordering;

use crate::common::{DmError, Result, Timestamp};
use crate::field_type::{ColumnDefine, Value};
use crate::rowkey::RowKeyValue;

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub handle:  RowKeyValue,
    pub version: Timestamp,
    /// 删除标记（tag 列）
    pub deleted: bool,
    pub values:  Vec<Value>,
}

impl Row {
    pub fn new(handle: RowKeyValue, version: Timestamp, values: Vec<Value>) -> Self {
        Self { handle, version, deleted: false, values }
    }

    pub fn new_int(handle: i64, version: Timestamp, values: Vec<Value>) -> Self {
        Self::new(RowKeyValue::from_int_handle(handle), version, values)
    }

    pub fn tombstone(handle: RowKeyValue, version: Timestamp) -> Self {
        Self { handle, version, deleted: true, values: Vec::new() }
    }

    pub fn estimated_bytes(&self) -> usize {
        self.handle.as_bytes().len() + 9 + self.values.iter().map(Value::estimated_bytes).sum::<usize>()
    }

    /// (handle, version) 升序
    pub fn cmp_key(&self, other: &Row) -> Ordering {
        self.handle.cmp(&other.handle).then(self.version.cmp(&other.version))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub rows: Vec<Row>,
}

impl Block {
    pub fn new(rows: Vec<Row>) -> Self { Self { rows } }

    pub fn rows(&self)     -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool  { self.rows.is_empty() }

    pub fn bytes(&self) -> usize {
        self.rows.iter().map(Row::estimated_bytes).sum()
    }

    pub fn sort(&mut self) {
        self.rows.sort_by(Row::cmp_key);
    }

    pub fn is_sorted(&self) -> bool {
        self.rows.windows(2).all(|w| w[0].cmp_key(&w[1]) != Ordering::Greater)
    }

    pub fn ensure_sorted(&self) -> Result<()> {
        if self.is_sorted() {
            return Ok(());
        }
        Err(DmError::Unsorted(format!("block of {} rows is not ordered by (handle, version)", self.rows())))
    }

    /// 每行的用户列数必须与 schema 中非保留列一致
    pub fn check_schema(&self, columns: &[ColumnDefine]) -> Result<()> {
        let expected = columns.len();
        for r in &self.rows {
            if !r.deleted && r.values.len() != expected {
                return Err(DmError::SchemaMismatch(format!(
                    "row {:?} has {} values, expect {expected}", r.handle, r.values.len()
                )));
            }
        }
        Ok(())
    }

    /// 按 `block_size` 切分
    pub fn split_into(self, block_size: usize) -> Vec<Block> {
        let size = block_size.max(1);
        let mut out = Vec::with_capacity(self.rows.len() / size + 1);
        let mut rows = self.rows.into_iter().peekable();
        while rows.peek().is_some() {
            out.push(Block::new(rows.by_ref().take(size).collect()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_orders_by_handle_then_version() {
        let mut b = Block::new(vec![
            Row::new_int(3, 1, vec![]),
            Row::new_int(1, 5, vec![]),
            Row::new_int(1, 2, vec![]),
        ]);
        assert!(b.ensure_sorted().is_err());
        b.sort();
        let keys: Vec<(i64, u64)> = b.rows.iter().map(|r| (r.handle.int_value(), r.version)).collect();
        assert_eq!(keys, vec![(1, 2), (1, 5), (3, 1)]);
    }

    #[test]
    fn split_into_chunks() {
        let b = Block::new((0..7).map(|i| Row::new_int(i, 1, vec![])).collect());
        let parts = b.split_into(3);
        assert_eq!(parts.iter().map(Block::rows).collect::<Vec<_>>(), vec![3, 3, 1]);
    }

    #[test]
    fn schema_width_checked() {
        let cols = vec![ColumnDefine::new(1, "a", crate::field_type::FieldType::Int64)];
        let b = Block::new(vec![Row::new_int(1, 1, vec![])]);
        assert!(matches!(b.check_schema(&cols), Err(DmError::SchemaMismatch(_))));
        let t = Block::new(vec![Row::tombstone(RowKeyValue::from_int_handle(1), 2)]);
        assert!(t.check_schema(&cols).is_ok());
    }
}
