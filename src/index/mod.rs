//! Min-max 粗糙索引
//!
//! 每列一个 `MinMaxIndex`，每个 pack 一项 `{has_null, has_value, min, max}`。
//! 比较判定只依据边界值，结果保守：`None` 保证无行命中，`All` 保证全部命中。
//!
//! 序列化格式：
//! ```text
//! field_type (u8) | pack_count (varint) | { has_null u8, has_value u8, min value, max value } * N
//! ```

pub mod cache;

pub use cache::{MinMaxIndexCache, MinMaxIndexKey};

use std::cmp::Ordering;
use std::io::Cursor;

use byteorder::ReadBytesExt;

use crate::codec::{read_count, read_value, write_value, write_varint};
use crate::common::{DmError, Result};
use crate::field_type::{FieldType, Value};
use crate::filter::{CompareOp, RSResult};

#[derive(Debug, Clone, PartialEq)]
pub struct PackMinMax {
    pub has_null:  bool,
    pub has_value: bool,
    pub min:       Value,
    pub max:       Value,
}

impl PackMinMax {
    fn from_values(values: &[Value]) -> Self {
        let mut entry = Self { has_null: false, has_value: false, min: Value::Null, max: Value::Null };
        for v in values {
            if v.is_null() {
                entry.has_null = true;
                continue;
            }
            if !entry.has_value {
                entry.min = v.clone();
                entry.max = v.clone();
                entry.has_value = true;
                continue;
            }
            if v.compare(&entry.min) == Some(Ordering::Less)    { entry.min = v.clone(); }
            if v.compare(&entry.max) == Some(Ordering::Greater) { entry.max = v.clone(); }
        }
        entry
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxIndex {
    field_type: FieldType,
    packs:      Vec<PackMinMax>,
}

impl MinMaxIndex {
    pub fn new(field_type: FieldType) -> Self {
        Self { field_type, packs: Vec::new() }
    }

    /// 追加一个 pack 的列值
    pub fn add_pack(&mut self, values: &[Value]) {
        self.packs.push(PackMinMax::from_values(values));
    }

    pub fn field_type(&self) -> FieldType   { self.field_type }
    pub fn pack_count(&self) -> usize       { self.packs.len() }
    pub fn pack(&self, i: usize) -> Option<&PackMinMax> { self.packs.get(i) }

    fn bounds(&self, pack_id: usize) -> Option<&PackMinMax> {
        self.packs.get(pack_id)
    }

    /// `col <op> value`
    pub fn check_cmp(&self, pack_id: usize, op: CompareOp, value: &Value) -> RSResult {
        let Some(p) = self.bounds(pack_id) else { return RSResult::Some };
        if !p.has_value {
            return if p.has_null { RSResult::NoneNull } else { RSResult::None };
        }
        Self::compare_bounds(p, op, value).with_null(p.has_null)
    }

    /// 只看非 NULL 行的判定结果
    fn compare_bounds(p: &PackMinMax, op: CompareOp, value: &Value) -> RSResult {
        if value.is_null() {
            return RSResult::Some;
        }
        let (Some(min_cmp), Some(max_cmp)) = (p.min.compare(value), p.max.compare(value)) else {
            return RSResult::Some;
        };
        use Ordering::*;
        match op {
            CompareOp::Equal => {
                if min_cmp == Equal && max_cmp == Equal { RSResult::All }
                else if min_cmp == Greater || max_cmp == Less { RSResult::None }
                else { RSResult::Some }
            }
            CompareOp::NotEqual => {
                if min_cmp == Equal && max_cmp == Equal { RSResult::None }
                else if min_cmp == Greater || max_cmp == Less { RSResult::All }
                else { RSResult::Some }
            }
            CompareOp::Greater => {
                if min_cmp == Greater { RSResult::All }
                else if max_cmp != Greater { RSResult::None }
                else { RSResult::Some }
            }
            CompareOp::GreaterEqual => {
                if min_cmp != Less { RSResult::All }
                else if max_cmp == Less { RSResult::None }
                else { RSResult::Some }
            }
            CompareOp::Less => {
                if max_cmp == Less { RSResult::All }
                else if min_cmp != Less { RSResult::None }
                else { RSResult::Some }
            }
            CompareOp::LessEqual => {
                if max_cmp != Greater { RSResult::All }
                else if min_cmp == Greater { RSResult::None }
                else { RSResult::Some }
            }
        }
    }

    /// `col IN (values)`
    pub fn check_in(&self, pack_id: usize, values: &[Value]) -> RSResult {
        let Some(p) = self.bounds(pack_id) else { return RSResult::Some };
        if !p.has_value {
            return if p.has_null { RSResult::NoneNull } else { RSResult::None };
        }
        let base = values.iter().fold(RSResult::None, |acc, v| {
            acc.or(Self::compare_bounds(p, CompareOp::Equal, v))
        });
        base.with_null(p.has_null)
    }

    pub fn check_is_null(&self, pack_id: usize) -> RSResult {
        let Some(p) = self.bounds(pack_id) else { return RSResult::Some };
        match (p.has_null, p.has_value) {
            (false, _)    => RSResult::None,
            (true, false) => RSResult::All,
            (true, true)  => RSResult::Some,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.packs.len() * 20 + 8);
        out.push(self.field_type.tag());
        write_varint(&mut out, self.packs.len() as u64);
        for p in &self.packs {
            out.push(p.has_null as u8);
            out.push(p.has_value as u8);
            write_value(&mut out, &p.min)?;
            write_value(&mut out, &p.max)?;
        }
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let tag = cur.read_u8()?;
        let field_type = FieldType::from_tag(tag)
            .ok_or_else(|| DmError::Encoding(format!("unknown field type tag {tag}")))?;
        let n = read_count(&mut cur, 4, "min-max pack")?;
        let mut packs = Vec::with_capacity(n);
        for _ in 0..n {
            let has_null  = cur.read_u8()? != 0;
            let has_value = cur.read_u8()? != 0;
            let min = read_value(&mut cur)?;
            let max = read_value(&mut cur)?;
            packs.push(PackMinMax { has_null, has_value, min, max });
        }
        Ok(Self { field_type, packs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(packs: &[&[i64]]) -> MinMaxIndex {
        let mut idx = MinMaxIndex::new(FieldType::Int64);
        for p in packs {
            let values: Vec<Value> = p.iter().copied().map(Value::Int64).collect();
            idx.add_pack(&values);
        }
        idx
    }

    #[test]
    fn bounds_follow_values() {
        let idx = index_of(&[&[5, -3, 9], &[1]]);
        let p0 = idx.pack(0).unwrap();
        assert_eq!((p0.min.clone(), p0.max.clone()), (Value::Int64(-3), Value::Int64(9)));
        assert_eq!(idx.pack_count(), 2);
    }

    #[test]
    fn every_compare_op_is_conservative() {
        let idx = index_of(&[&[10, 15, 20]]);
        let v = |x| Value::Int64(x);
        assert_eq!(idx.check_cmp(0, CompareOp::Equal, &v(30)), RSResult::None);
        assert_eq!(idx.check_cmp(0, CompareOp::Equal, &v(15)), RSResult::Some);
        assert_eq!(idx.check_cmp(0, CompareOp::NotEqual, &v(3)), RSResult::All);
        assert_eq!(idx.check_cmp(0, CompareOp::GreaterEqual, &v(10)), RSResult::All);
        assert_eq!(idx.check_cmp(0, CompareOp::GreaterEqual, &v(21)), RSResult::None);
        assert_eq!(idx.check_cmp(0, CompareOp::Less, &v(10)), RSResult::None);
        assert_eq!(idx.check_cmp(0, CompareOp::Less, &v(21)), RSResult::All);
        assert_eq!(idx.check_cmp(0, CompareOp::LessEqual, &v(20)), RSResult::All);
        assert_eq!(idx.check_cmp(0, CompareOp::LessEqual, &v(12)), RSResult::Some);
        assert_eq!(idx.check_cmp(0, CompareOp::Greater, &v(20)), RSResult::None);
    }

    #[test]
    fn single_value_pack_equality() {
        let idx = index_of(&[&[7, 7]]);
        assert_eq!(idx.check_cmp(0, CompareOp::Equal, &Value::Int64(7)), RSResult::All);
        assert_eq!(idx.check_cmp(0, CompareOp::NotEqual, &Value::Int64(7)), RSResult::None);
        assert_eq!(idx.check_in(0, &[Value::Int64(1), Value::Int64(7)]), RSResult::All);
        assert_eq!(idx.check_in(0, &[Value::Int64(1), Value::Int64(2)]), RSResult::None);
    }

    #[test]
    fn null_only_pack() {
        let mut idx = MinMaxIndex::new(FieldType::Int64);
        idx.add_pack(&[Value::Null, Value::Null]);
        assert_eq!(idx.check_is_null(0), RSResult::All);
        assert!(!idx.check_cmp(0, CompareOp::Greater, &Value::Int64(0)).is_use());
    }

    #[test]
    fn incomparable_and_out_of_range_are_some() {
        let idx = index_of(&[&[1, 2]]);
        assert_eq!(idx.check_cmp(0, CompareOp::Equal, &Value::Bytes(b"x".to_vec())), RSResult::Some);
        assert_eq!(idx.check_cmp(5, CompareOp::Equal, &Value::Int64(1)), RSResult::Some);
        assert_eq!(idx.check_is_null(0), RSResult::None);
    }

    #[test]
    fn serialized_index_restores() {
        let mut idx = index_of(&[&[3, 4], &[-1, 8]]);
        idx.add_pack(&[Value::Null]);
        let back = MinMaxIndex::deserialize(&idx.serialize().unwrap()).unwrap();
        assert_eq!(back, idx);
    }

    #[test]
    fn huge_pack_count_is_corruption() {
        let mut data = vec![FieldType::Int64.tag()];
        write_varint(&mut data, 1 << 62);
        assert!(matches!(MinMaxIndex::deserialize(&data), Err(DmError::Corruption(_))));
    }
}
