//! Rough-set 过滤算子
//!
//! 下推谓词被翻译为 `RSOperator` 表达式树，针对每个 pack 的 min/max 索引做符号化求值，
//! 结果为六值格 `RSResult`：
//!
//! ```text
//!           None      Some      All
//!  +null    NoneNull  SomeNull  AllNull
//! ```
//!
//! 带 `Null` 的变体表示 pack 中存在 NULL 行：这些行上谓词求值为 NULL（既不满足也不
//! 不满足），因此 `Not` 时保留 null 标记，而不是把它们当作"满足"翻转过去。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::common::ColId;
use crate::field_type::{FieldType, Value};
use crate::index::MinMaxIndex;

// ── RSResult ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RSResult {
    /// 没有行满足
    None,
    /// 需要逐行判断
    Some,
    /// 所有行满足
    All,
    NoneNull,
    SomeNull,
    AllNull,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Base { None, Some, All }

impl RSResult {
    fn split(self) -> (Base, bool) {
        match self {
            Self::None     => (Base::None, false),
            Self::Some     => (Base::Some, false),
            Self::All      => (Base::All,  false),
            Self::NoneNull => (Base::None, true),
            Self::SomeNull => (Base::Some, true),
            Self::AllNull  => (Base::All,  true),
        }
    }

    fn join(base: Base, has_null: bool) -> Self {
        match (base, has_null) {
            (Base::None, false) => Self::None,
            (Base::Some, false) => Self::Some,
            (Base::All,  false) => Self::All,
            (Base::None, true)  => Self::NoneNull,
            (Base::Some, true)  => Self::SomeNull,
            (Base::All,  true)  => Self::AllNull,
        }
    }

    pub fn has_null(self) -> bool { self.split().1 }

    /// 附加 null 标记
    pub fn with_null(self, has_null: bool) -> Self {
        let (base, null) = self.split();
        Self::join(base, null || has_null)
    }

    /// pack 是否需要读取
    pub fn is_use(self) -> bool {
        !matches!(self, Self::None | Self::NoneNull)
    }

    /// 所有行确定满足（可跳过逐行过滤）
    pub fn all_match(self) -> bool { self == Self::All }

    /// 收敛到三值：NoneNull → None，SomeNull / AllNull → Some
    pub fn normalize(self) -> Self {
        match self {
            Self::NoneNull => Self::None,
            Self::SomeNull | Self::AllNull => Self::Some,
            other => other,
        }
    }

    pub fn not(self) -> Self {
        let (base, null) = self.split();
        let flipped = match base {
            Base::None => Base::All,
            Base::All  => Base::None,
            Base::Some => Base::Some,
        };
        Self::join(flipped, null)
    }

    pub fn and(self, other: Self) -> Self {
        let (a, an) = self.split();
        let (b, bn) = other.split();
        let base = match (a, b) {
            (Base::None, _) | (_, Base::None) => Base::None,
            (Base::All, Base::All)            => Base::All,
            _                                 => Base::Some,
        };
        Self::join(base, an || bn)
    }

    pub fn or(self, other: Self) -> Self {
        let (a, an) = self.split();
        let (b, bn) = other.split();
        let base = match (a, b) {
            (Base::All, _) | (_, Base::All) => Base::All,
            (Base::None, Base::None)        => Base::None,
            _                               => Base::Some,
        };
        Self::join(base, an || bn)
    }
}

// ── RSOperator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
}

impl CompareOp {
    fn name(self) -> &'static str {
        match self {
            Self::Equal        => "equal",
            Self::NotEqual     => "not_equal",
            Self::Greater      => "greater",
            Self::GreaterEqual => "greater_equal",
            Self::Less         => "less",
            Self::LessEqual    => "less_equal",
        }
    }
}

/// 下推谓词表达式树
#[derive(Debug, Clone, PartialEq)]
pub enum RSOperator {
    Compare { col: ColId, op: CompareOp, value: Value },
    In      { col: ColId, values: Vec<Value> },
    IsNull  { col: ColId },
    And(Vec<RSOperator>),
    Or(Vec<RSOperator>),
    Not(Box<RSOperator>),
    /// 无法翻译的子表达式，始终返回 Some
    Unsupported(String),
}

/// 一次 rough check 所需的索引集合：列 id → (类型, 索引)
#[derive(Debug, Default, Clone)]
pub struct RSCheckParam {
    pub indexes: HashMap<ColId, (FieldType, Arc<MinMaxIndex>)>,
}

impl RSCheckParam {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, col: ColId, field_type: FieldType, index: Arc<MinMaxIndex>) {
        self.indexes.insert(col, (field_type, index));
    }
}

impl RSOperator {
    pub fn equal(col: ColId, value: Value)         -> Self { Self::Compare { col, op: CompareOp::Equal, value } }
    pub fn not_equal(col: ColId, value: Value)     -> Self { Self::Compare { col, op: CompareOp::NotEqual, value } }
    pub fn greater(col: ColId, value: Value)       -> Self { Self::Compare { col, op: CompareOp::Greater, value } }
    pub fn greater_equal(col: ColId, value: Value) -> Self { Self::Compare { col, op: CompareOp::GreaterEqual, value } }
    pub fn less(col: ColId, value: Value)          -> Self { Self::Compare { col, op: CompareOp::Less, value } }
    pub fn less_equal(col: ColId, value: Value)    -> Self { Self::Compare { col, op: CompareOp::LessEqual, value } }
    pub fn in_values(col: ColId, values: Vec<Value>) -> Self { Self::In { col, values } }
    pub fn is_null(col: ColId) -> Self { Self::IsNull { col } }

    /// 表达式引用的列（去重、有序）
    pub fn column_ids(&self) -> Vec<ColId> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_columns(&self, out: &mut Vec<ColId>) {
        match self {
            Self::Compare { col, .. } | Self::In { col, .. } | Self::IsNull { col } => out.push(*col),
            Self::And(children) | Self::Or(children) => {
                for c in children { c.collect_columns(out); }
            }
            Self::Not(child)     => child.collect_columns(out),
            Self::Unsupported(_) => {}
        }
    }

    /// 针对第 `pack_id` 个 pack 求值。缺少索引的列退化为 Some。
    pub fn rough_check(&self, pack_id: usize, param: &RSCheckParam) -> RSResult {
        match self {
            Self::Compare { col, op, value } => match param.indexes.get(col) {
                Some((_, idx)) => idx.check_cmp(pack_id, *op, value),
                None           => RSResult::Some,
            },
            Self::In { col, values } => match param.indexes.get(col) {
                Some((_, idx)) => idx.check_in(pack_id, values),
                None           => RSResult::Some,
            },
            Self::IsNull { col } => match param.indexes.get(col) {
                Some((_, idx)) => idx.check_is_null(pack_id),
                None           => RSResult::Some,
            },
            Self::And(children) => children.iter()
                .fold(RSResult::All, |acc, c| acc.and(c.rough_check(pack_id, param))),
            Self::Or(children) => children.iter()
                .fold(RSResult::None, |acc, c| acc.or(c.rough_check(pack_id, param))),
            Self::Not(child)     => child.rough_check(pack_id, param).not(),
            Self::Unsupported(_) => RSResult::Some,
        }
    }
}

impl fmt::Display for RSOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { col, op, value } =>
                write!(f, "{{\"op\":\"{}\",\"col\":{col},\"value\":\"{value}\"}}", op.name()),
            Self::In { col, values } => {
                let vs: Vec<String> = values.iter().map(|v| format!("\"{v}\"")).collect();
                write!(f, "{{\"op\":\"in\",\"col\":{col},\"value\":[{}]}}", vs.join(","))
            }
            Self::IsNull { col } => write!(f, "{{\"op\":\"isnull\",\"col\":{col}}}"),
            Self::And(children) | Self::Or(children) => {
                let name = if matches!(self, Self::And(_)) { "and" } else { "or" };
                let cs: Vec<String> = children.iter().map(|c| c.to_string()).collect();
                write!(f, "{{\"op\":\"{name}\",\"children\":[{}]}}", cs.join(","))
            }
            Self::Not(child)          => write!(f, "{{\"op\":\"not\",\"children\":[{child}]}}"),
            Self::Unsupported(reason) => write!(f, "{{\"op\":\"unsupported\",\"reason\":\"{reason}\"}}"),
        }
    }
}
