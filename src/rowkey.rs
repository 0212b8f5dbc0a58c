//! RowKey 值与半开区间 `[start, end)`
//!
//! 两种物理编码：
//! - **int handle**    — 8 字节可比较编码（大端 + 符号位翻转），比较时走 i64 快速路径
//! - **common handle** — 任意长度的组合主键字节串，逐字节比较，长度作为平局裁决
//!
//! 跨编码比较属于编程错误，直接 panic。

use std::cmp::Ordering;
use std::fmt;
use std::io::{Cursor, Read};
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use byteorder::ReadBytesExt;
use lru::LruCache;
use parking_lot::Mutex;

use crate::codec::{read_bytes, read_varint, write_bytes, write_varint};
use crate::common::{corruption, Result};

/// TiDB datum 编码标志位
pub mod codec_flag {
    pub const NIL:   u8 = 0;
    pub const BYTES: u8 = 1;
    pub const INT:   u8 = 3;
    pub const MAX:   u8 = 250;
}

pub type KeyspaceId = u32;
pub type TableId    = i64;

// ── int handle 编码 ───────────────────────────────────────────────────────────

const SIGN_MASK: u64 = 1 << 63;

/// 保序编码：翻转符号位后按大端写出
pub fn encode_int64(v: i64) -> [u8; 8] {
    ((v as u64) ^ SIGN_MASK).to_be_bytes()
}

/// 解码前 8 字节；不足 8 字节时右侧补零
pub fn decode_int64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    (u64::from_be_bytes(buf) ^ SIGN_MASK) as i64
}

fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    // slice 的 Ord 即 memcmp 后按长度裁决
    a.cmp(b)
}

// ── RowKeyValue ───────────────────────────────────────────────────────────────

/// 行键。构造后不可变，底层字节以 `Arc` 在多个区间之间共享。
#[derive(Clone)]
pub struct RowKeyValue {
    is_common_handle: bool,
    value:            Arc<[u8]>,
    /// int handle 的整数值；common handle 不参与比较
    int_value:        i64,
}

static INT_HANDLE_MIN_KEY:    OnceLock<RowKeyValue> = OnceLock::new();
static INT_HANDLE_MAX_KEY:    OnceLock<RowKeyValue> = OnceLock::new();
static COMMON_HANDLE_MIN_KEY: OnceLock<RowKeyValue> = OnceLock::new();
static COMMON_HANDLE_MAX_KEY: OnceLock<RowKeyValue> = OnceLock::new();

impl RowKeyValue {
    pub fn from_int_handle(v: i64) -> Self {
        Self { is_common_handle: false, value: Arc::from(&encode_int64(v)[..]), int_value: v }
    }

    pub fn from_common_handle(bytes: &[u8]) -> Self {
        Self { is_common_handle: true, value: Arc::from(bytes), int_value: 0 }
    }

    /// 从持久化字节恢复。int handle 若带有后缀（长度 > 8），int_value 取下一个整数。
    pub fn from_handle(is_common_handle: bool, bytes: &[u8]) -> Self {
        if is_common_handle {
            return Self::from_common_handle(bytes);
        }
        let decoded   = decode_int64(bytes);
        let int_value = if bytes.len() > 8 { decoded.saturating_add(1) } else { decoded };
        Self { is_common_handle: false, value: Arc::from(bytes), int_value }
    }

    /// int handle 的最小哨兵：encode(i64::MIN)
    pub fn int_handle_min() -> &'static RowKeyValue {
        INT_HANDLE_MIN_KEY.get_or_init(|| Self::from_int_handle(i64::MIN))
    }

    /// int handle 的最大哨兵：encode(i64::MAX) ++ 0x00，严格大于真实的 i64::MAX
    pub fn int_handle_max() -> &'static RowKeyValue {
        INT_HANDLE_MAX_KEY.get_or_init(|| {
            let mut bytes = encode_int64(i64::MAX).to_vec();
            bytes.push(0);
            Self { is_common_handle: false, value: Arc::from(bytes), int_value: i64::MAX }
        })
    }

    pub fn common_handle_min() -> &'static RowKeyValue {
        COMMON_HANDLE_MIN_KEY.get_or_init(|| Self::from_common_handle(&[codec_flag::BYTES]))
    }

    pub fn common_handle_max() -> &'static RowKeyValue {
        COMMON_HANDLE_MAX_KEY.get_or_init(|| Self::from_common_handle(&[codec_flag::MAX]))
    }

    pub fn min_key(is_common_handle: bool) -> &'static RowKeyValue {
        if is_common_handle { Self::common_handle_min() } else { Self::int_handle_min() }
    }

    pub fn max_key(is_common_handle: bool) -> &'static RowKeyValue {
        if is_common_handle { Self::common_handle_max() } else { Self::int_handle_max() }
    }

    pub fn is_common_handle(&self) -> bool { self.is_common_handle }
    pub fn as_bytes(&self)         -> &[u8] { &self.value }
    pub fn int_value(&self)        -> i64  { self.int_value }

    fn is_int_infinite(&self) -> bool {
        compare_bytes(&self.value, &Self::int_handle_max().value) == Ordering::Equal
    }

    /// 同编码下的全序比较
    pub fn compare(&self, other: &RowKeyValue) -> Ordering {
        if self.is_common_handle != other.is_common_handle {
            panic!(
                "common handle rowkey value compared with int handle rowkey value: {} vs {}",
                self.to_debug_string(), other.to_debug_string()
            );
        }
        if self.is_common_handle {
            return compare_bytes(&self.value, &other.value);
        }
        if self.int_value != other.int_value || self.int_value != i64::MAX {
            return self.int_value.cmp(&other.int_value);
        }
        // 两边都是 i64::MAX：整数无法区分真实值与开区间哨兵，回退到字节判定
        self.is_int_infinite().cmp(&other.is_int_infinite())
    }

    /// `[self, self.to_prefix_next())` 覆盖所有以 self 为前缀的键
    pub fn to_prefix_next(&self) -> RowKeyValue {
        let mut keys = self.value.to_vec();
        match keys.iter().rposition(|&b| b != u8::MAX) {
            Some(idx) => {
                keys[idx] += 1;
                for b in &mut keys[idx + 1..] { *b = 0; }
            }
            None => keys.push(0),
        }
        let int_value = if !self.is_common_handle && self.int_value != i64::MAX {
            self.int_value + 1
        } else {
            self.int_value
        };
        RowKeyValue { is_common_handle: self.is_common_handle, value: Arc::from(keys), int_value }
    }

    /// 严格大于 self 的最小行键
    pub fn to_next(&self) -> RowKeyValue {
        if !self.is_common_handle {
            return self.to_prefix_next();
        }
        let mut keys = self.value.to_vec();
        keys.push(0);
        RowKeyValue { is_common_handle: true, value: Arc::from(keys), int_value: self.int_value }
    }

    pub fn to_debug_string(&self) -> String {
        if self.is_common_handle {
            if self.value.as_ref() == Self::common_handle_max().as_bytes() {
                return "+Inf".into();
            }
            return self.value.iter().map(|b| format!("{b:02X}")).collect();
        }
        if self.is_int_infinite() { "+Inf".into() } else { self.int_value.to_string() }
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.is_common_handle as u8);
        write_bytes(out, &self.value);
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let is_common = r.read_u8()? != 0;
        let bytes = read_bytes(r)?;
        Ok(Self::from_handle(is_common, &bytes))
    }
}

impl PartialEq for RowKeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.is_common_handle == other.is_common_handle && self.compare(other) == Ordering::Equal
    }
}

impl Eq for RowKeyValue {}

impl PartialOrd for RowKeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.compare(other)) }
}

impl Ord for RowKeyValue {
    fn cmp(&self, other: &Self) -> Ordering { self.compare(other) }
}

impl fmt::Debug for RowKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_debug_string())
    }
}

// ── RowKeyRange ───────────────────────────────────────────────────────────────

/// 半开区间 `[start, end)`。`start >= end` 表示空区间。
#[derive(Clone)]
pub struct RowKeyRange {
    pub is_common_handle:   bool,
    pub start:              RowKeyValue,
    pub end:                RowKeyValue,
    /// 主键列数，反序列化时用于识别旧版本的开区间编码
    pub rowkey_column_size: usize,
}

impl RowKeyRange {
    pub fn new(
        start:              RowKeyValue,
        end:                RowKeyValue,
        is_common_handle:   bool,
        rowkey_column_size: usize,
    ) -> Self {
        Self { is_common_handle, start, end, rowkey_column_size }
    }

    /// 覆盖整个键空间
    pub fn new_all(is_common_handle: bool, rowkey_column_size: usize) -> Self {
        Self::new(
            RowKeyValue::min_key(is_common_handle).clone(),
            RowKeyValue::max_key(is_common_handle).clone(),
            is_common_handle, rowkey_column_size,
        )
    }

    /// 不覆盖任何数据（start = MAX, end = MIN）
    pub fn new_none(is_common_handle: bool, rowkey_column_size: usize) -> Self {
        Self::new(
            RowKeyValue::max_key(is_common_handle).clone(),
            RowKeyValue::min_key(is_common_handle).clone(),
            is_common_handle, rowkey_column_size,
        )
    }

    pub fn start_from(start: RowKeyValue, is_common_handle: bool, rowkey_column_size: usize) -> Self {
        Self::new(start, RowKeyValue::max_key(is_common_handle).clone(), is_common_handle, rowkey_column_size)
    }

    pub fn end_with(end: RowKeyValue, is_common_handle: bool, rowkey_column_size: usize) -> Self {
        Self::new(RowKeyValue::min_key(is_common_handle).clone(), end, is_common_handle, rowkey_column_size)
    }

    /// `[start, end)` 的整数区间。`end == i64::MAX` 视为开区间上界。
    pub fn from_handle_range(start: i64, end: i64, is_common_handle: bool) -> Self {
        if is_common_handle {
            if start == i64::MIN && end == i64::MAX {
                return Self::new_all(true, 1);
            }
            let encode = |v: i64| {
                let mut b = vec![codec_flag::INT];
                b.extend_from_slice(&encode_int64(v));
                RowKeyValue::from_common_handle(&b)
            };
            let end_key = if end == i64::MAX {
                RowKeyValue::common_handle_max().clone()
            } else {
                encode(end)
            };
            return Self::new(encode(start), end_key, true, 1);
        }
        let end_key = if end == i64::MAX {
            RowKeyValue::int_handle_max().clone()
        } else {
            RowKeyValue::from_int_handle(end)
        };
        Self::new(RowKeyValue::from_int_handle(start), end_key, false, 1)
    }

    /// `[start, end]`，只允许右端点为 i64::MAX（即包含最大整数键）
    pub fn from_handle_range_inclusive(start: i64, end: i64) -> Self {
        if end != i64::MAX {
            panic!("right-inclusive rowkey range must end at i64::MAX, got end={end}");
        }
        Self::new(
            RowKeyValue::from_int_handle(start),
            RowKeyValue::int_handle_max().clone(),
            false, 1,
        )
    }

    pub fn to_handle_range(&self) -> Option<(i64, i64)> {
        (!self.is_common_handle).then(|| (self.start.int_value, self.end.int_value))
    }

    pub fn is_start_infinite(&self) -> bool {
        if self.is_common_handle {
            let s = self.start.as_bytes();
            s.len() == 1 && (s[0] == codec_flag::BYTES || s[0] == codec_flag::NIL)
        } else {
            self.start.int_value == i64::MIN
        }
    }

    pub fn is_end_infinite(&self) -> bool {
        if self.is_common_handle {
            let e = self.end.as_bytes();
            e.len() == 1 && e[0] == codec_flag::MAX
        } else {
            self.end.int_value == i64::MAX
                && compare_bytes(self.end.as_bytes(), RowKeyValue::int_handle_max().as_bytes())
                    != Ordering::Less
        }
    }

    pub fn all(&self)  -> bool { self.is_start_infinite() && self.is_end_infinite() }
    pub fn none(&self) -> bool { self.start >= self.end }

    /// 区间交：max(start) / min(end)
    pub fn shrink(&self, other: &RowKeyRange) -> RowKeyRange {
        Self::new(
            std::cmp::max(&self.start, &other.start).clone(),
            std::cmp::min(&self.end, &other.end).clone(),
            self.is_common_handle, self.rowkey_column_size,
        )
    }

    /// 包围两者的最小区间
    pub fn merge(&self, other: &RowKeyRange) -> RowKeyRange {
        Self::new(
            std::cmp::min(&self.start, &other.start).clone(),
            std::cmp::max(&self.end, &other.end).clone(),
            self.is_common_handle, self.rowkey_column_size,
        )
    }

    pub fn intersect(&self, other: &RowKeyRange) -> bool {
        other.start < self.end && self.start < other.end
    }

    /// start <= key
    pub fn check_start(&self, key: &RowKeyValue) -> bool { &self.start <= key }
    /// key < end
    pub fn check_end(&self, key: &RowKeyValue)   -> bool { key < &self.end }
    pub fn check(&self, key: &RowKeyValue)       -> bool { self.check_start(key) && self.check_end(key) }

    /// `rhs` 是否被本区间包含。右端点相等也算包含。
    pub fn check_range_included(&self, rhs: &RowKeyRange) -> bool {
        self.check_start(&rhs.start) && (self.end == rhs.end || self.check_end(&rhs.end))
    }

    /// 将有序 handle 切片中 `[offset, offset+limit)` 裁剪到本区间，返回裁剪后的 (offset, limit)
    pub fn get_pos_range(&self, handles: &[RowKeyValue], offset: usize, limit: usize) -> (usize, usize) {
        let end   = (offset + limit).min(handles.len());
        let slice = &handles[offset.min(end)..end];
        let lo = slice.partition_point(|h| !self.check_start(h));
        let hi = slice.partition_point(|h| self.check_end(h)).max(lo);
        (offset + lo, hi - lo)
    }

    /// 转换为 region 原始键：`[x{keyspace}]t{table_id}_r{handle}`
    pub fn to_region_range(&self, keyspace_id: Option<KeyspaceId>, table_id: TableId) -> (Vec<u8>, Vec<u8>) {
        let prefix = table_record_prefix(keyspace_id, table_id);
        let mut start = prefix.clone();
        start.extend_from_slice(self.start.as_bytes());
        let mut end = prefix;
        end.extend_from_slice(self.end.as_bytes());
        (start, end)
    }

    // ── 序列化 ────────────────────────────────────────────────────────────────
    //
    // { is_common_handle: u8, rowkey_column_size: varint, start: bytes, end: bytes }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.start.as_bytes().len() + self.end.as_bytes().len() + 8);
        self.write_to(&mut out);
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let range = Self::read_from(&mut cur)?;
        if cur.position() as usize != data.len() {
            return Err(corruption("trailing bytes after rowkey range"));
        }
        Ok(range)
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.is_common_handle as u8);
        write_varint(out, self.rowkey_column_size as u64);
        write_bytes(out, self.start.as_bytes());
        write_bytes(out, self.end.as_bytes());
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let is_common_handle   = r.read_u8()? != 0;
        let rowkey_column_size = read_varint(r)? as usize;
        let start_bytes = read_bytes(r)?;
        let end_bytes   = read_bytes(r)?;

        let start = if is_common_handle && is_legacy_common_min(rowkey_column_size, &start_bytes) {
            RowKeyValue::common_handle_min().clone()
        } else {
            RowKeyValue::from_handle(is_common_handle, &start_bytes)
        };
        let end = if is_common_handle && is_legacy_common_max(rowkey_column_size, &end_bytes) {
            RowKeyValue::common_handle_max().clone()
        } else {
            RowKeyValue::from_handle(is_common_handle, &end_bytes)
        };
        Ok(Self::new(start, end, is_common_handle, rowkey_column_size))
    }

    pub fn to_debug_string(&self) -> String {
        format!("[{}, {})", self.start.to_debug_string(), self.end.to_debug_string())
    }
}

impl PartialEq for RowKeyRange {
    fn eq(&self, rhs: &Self) -> bool {
        self.is_common_handle == rhs.is_common_handle && self.start == rhs.start && self.end == rhs.end
    }
}

impl Eq for RowKeyRange {}

impl fmt::Debug for RowKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_debug_string())
    }
}

/// 旧版本以每列一个 BYTES/NIL 标志字节表示负无穷
pub fn is_legacy_common_min(column_size: usize, value: &[u8]) -> bool {
    column_size > 0
        && value.len() == column_size
        && value.iter().all(|&b| b == codec_flag::BYTES || b == codec_flag::NIL)
}

/// 旧版本以每列一个 MAX 标志字节表示正无穷
pub fn is_legacy_common_max(column_size: usize, value: &[u8]) -> bool {
    column_size > 0
        && value.len() == column_size
        && value.iter().all(|&b| b == codec_flag::MAX)
}

/// 包围所有区间的最小区间；输入为空时返回空区间
pub fn merge_ranges(ranges: &[RowKeyRange], is_common_handle: bool, rowkey_column_size: usize) -> RowKeyRange {
    ranges.iter().fold(
        RowKeyRange::new_none(is_common_handle, rowkey_column_size),
        |acc, r| acc.merge(r),
    )
}

/// 将读取区间裁剪到目标区间，丢弃裁剪后为空的区间
pub fn shrink_ranges(target: &RowKeyRange, read_ranges: &[RowKeyRange]) -> Vec<RowKeyRange> {
    read_ranges.iter()
        .map(|r| r.shrink(target))
        .filter(|r| !r.none())
        .collect()
}

// ── 表级 min/max 键缓存 ───────────────────────────────────────────────────────

const NULLSPACE_ID: KeyspaceId = u32::MAX;

fn table_record_prefix(keyspace_id: Option<KeyspaceId>, table_id: TableId) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(16);
    if let Some(ks) = keyspace_id.filter(|&ks| ks != NULLSPACE_ID) {
        prefix.push(b'x');
        prefix.extend_from_slice(&ks.to_be_bytes()[1..]);
    }
    prefix.push(b't');
    prefix.extend_from_slice(&encode_int64(table_id));
    prefix.extend_from_slice(b"_r");
    prefix
}

/// 一张表在 region 键空间中的最小/最大记录键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRangeMinMax {
    pub min: Vec<u8>,
    pub max: Vec<u8>,
}

impl TableRangeMinMax {
    fn build(keyspace_id: Option<KeyspaceId>, table_id: TableId, is_common_handle: bool) -> Self {
        let prefix = table_record_prefix(keyspace_id, table_id);
        let mut min = prefix.clone();
        min.extend_from_slice(RowKeyValue::min_key(is_common_handle).as_bytes());
        let mut max = prefix;
        max.extend_from_slice(RowKeyValue::max_key(is_common_handle).as_bytes());
        Self { min, max }
    }
}

type TableRangeKey = (Option<KeyspaceId>, TableId, bool);

/// 有界 LRU 缓存，由 DMContext 持有
pub struct TableRangeMinMaxCache {
    inner: Mutex<LruCache<TableRangeKey, Arc<TableRangeMinMax>>>,
}

impl TableRangeMinMaxCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { inner: Mutex::new(LruCache::new(cap)) }
    }

    pub fn get(&self, keyspace_id: Option<KeyspaceId>, table_id: TableId, is_common_handle: bool) -> Arc<TableRangeMinMax> {
        let key = (keyspace_id, table_id, is_common_handle);
        let mut guard = self.inner.lock();
        if let Some(v) = guard.get(&key) {
            return v.clone();
        }
        let v = Arc::new(TableRangeMinMax::build(keyspace_id, table_id, is_common_handle));
        guard.put(key, v.clone());
        v
    }

    pub fn len(&self) -> usize { self.inner.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
