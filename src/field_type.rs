//! 列的物理类型、运行时值与列定义

use std::cmp::Ordering;
use crate::common::ColId;

/// 列在 DMFile 中的存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int8, Int16, Int32, Int64,
    UInt64,
    Float32, Float64,
    /// 变长字节（Varchar / String / common handle）
    Bytes,
    /// 日期存储为 i32（天数）
    Date,
}

impl FieldType {
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::UInt64 | Self::Date)
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Int8    => 1,
            Self::Int16   => 2,
            Self::Int32   => 3,
            Self::Int64   => 4,
            Self::UInt64  => 5,
            Self::Float32 => 6,
            Self::Float64 => 7,
            Self::Bytes   => 8,
            Self::Date    => 9,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Int8,
            2 => Self::Int16,
            3 => Self::Int32,
            4 => Self::Int64,
            5 => Self::UInt64,
            6 => Self::Float32,
            7 => Self::Float64,
            8 => Self::Bytes,
            9 => Self::Date,
            _ => return None,
        })
    }
}

/// 列定义（schema 中的一列）
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefine {
    pub id:         ColId,
    pub name:       String,
    pub field_type: FieldType,
}

impl ColumnDefine {
    pub fn new(id: ColId, name: &str, field_type: FieldType) -> Self {
        Self { id, name: name.into(), field_type }
    }
}

/// 列值（运行时表示）
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
    Date(i32),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)   => Some(*v as i64),
            Self::Int16(v)  => Some(*v as i64),
            Self::Int32(v)  => Some(*v as i64),
            Self::Int64(v)  => Some(*v),
            Self::Date(v)   => Some(*v as i64),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            Self::UInt64(v)  => Some(*v as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Bytes(b) => Some(b), _ => None }
    }

    /// 用于 min/max 判定的比较。NULL 或类型不可比时返回 None。
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Bytes(a), Self::Bytes(b))  => Some(a.as_slice().cmp(b.as_slice())),
            (Self::Bytes(_), _) | (_, Self::Bytes(_)) => None,
            (Self::UInt64(a), Self::UInt64(b)) => Some(a.cmp(b)),
            (Self::Float32(_) | Self::Float64(_), _) | (_, Self::Float32(_) | Self::Float64(_)) =>
                self.as_f64()?.partial_cmp(&other.as_f64()?),
            // u64 超过 i64 范围时仍可比较
            (Self::UInt64(a), _) => match other.as_i64()? {
                b if b < 0 => Some(Ordering::Greater),
                b => Some(a.cmp(&(b as u64))),
            },
            (_, Self::UInt64(b)) => match self.as_i64()? {
                a if a < 0 => Some(Ordering::Less),
                a => Some((a as u64).cmp(b)),
            },
            _ => Some(self.as_i64()?.cmp(&other.as_i64()?)),
        }
    }

    /// 粗略的内存占用，用于统计 bytes
    pub fn estimated_bytes(&self) -> usize {
        match self {
            Self::Null                     => 1,
            Self::Int8(_)                  => 1,
            Self::Int16(_)                 => 2,
            Self::Int32(_) | Self::Date(_) | Self::Float32(_) => 4,
            Self::Int64(_) | Self::UInt64(_) | Self::Float64(_) => 8,
            Self::Bytes(b)                 => b.len() + 4,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::UInt64(v)  => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Bytes(b)   => write!(f, "{}", String::from_utf8_lossy(b)),
            Self::Date(v)    => write!(f, "date({v})"),
        }
    }
}
