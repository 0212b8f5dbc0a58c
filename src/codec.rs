//! 值序列化与 varint
//!
//! 列块与 tiny delta 页都使用自描述编码：每个值一个类型标签字节，后跟定长小端
//! payload；Bytes 以 varint 长度前缀。

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use crate::common::{corruption, DmError, Result};
use crate::field_type::Value;

const TAG_NULL: u8 = 0;

// ── varint（LEB128）───────────────────────────────────────────────────────────

pub fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift  = 0u32;
    loop {
        let b = r.read_u8()?;
        if shift >= 64 {
            return Err(DmError::Encoding("varint overflow".into()));
        }
        result |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// varint 长度前缀的字节串
pub fn write_bytes(out: &mut Vec<u8>, b: &[u8]) {
    write_varint(out, b.len() as u64);
    out.extend_from_slice(b);
}

pub fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_varint(r)?;
    let mut buf = Vec::new();
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(corruption(format!("byte string of {len} bytes truncated at {}", buf.len())));
    }
    Ok(buf)
}

/// 读出一个元素个数。每个元素至少占 `min_item_bytes` 字节，放不进剩余字节的个数视为损坏。
pub fn read_count(cur: &mut Cursor<&[u8]>, min_item_bytes: usize, what: &str) -> Result<usize> {
    let n = read_varint(cur)?;
    let remaining = cur.get_ref().len().saturating_sub(cur.position() as usize);
    if n > (remaining / min_item_bytes.max(1)) as u64 {
        return Err(corruption(format!("{what} count {n} exceeds {remaining} remaining bytes")));
    }
    Ok(n as usize)
}

// ── Value ─────────────────────────────────────────────────────────────────────

pub fn write_value(out: &mut Vec<u8>, v: &Value) -> Result<()> {
    match v {
        Value::Null       => out.push(TAG_NULL),
        Value::Int8(x)    => { out.push(1); out.write_i8(*x)?; }
        Value::Int16(x)   => { out.push(2); out.write_i16::<LittleEndian>(*x)?; }
        Value::Int32(x)   => { out.push(3); out.write_i32::<LittleEndian>(*x)?; }
        Value::Int64(x)   => { out.push(4); out.write_i64::<LittleEndian>(*x)?; }
        Value::UInt64(x)  => { out.push(5); out.write_u64::<LittleEndian>(*x)?; }
        Value::Float32(x) => { out.push(6); out.write_f32::<LittleEndian>(*x)?; }
        Value::Float64(x) => { out.push(7); out.write_f64::<LittleEndian>(*x)?; }
        Value::Bytes(b)   => { out.push(8); write_bytes(out, b); }
        Value::Date(x)    => { out.push(9); out.write_i32::<LittleEndian>(*x)?; }
    }
    Ok(())
}

pub fn read_value<R: Read>(r: &mut R) -> Result<Value> {
    let tag = r.read_u8()?;
    Ok(match tag {
        TAG_NULL => Value::Null,
        1 => Value::Int8(r.read_i8()?),
        2 => Value::Int16(r.read_i16::<LittleEndian>()?),
        3 => Value::Int32(r.read_i32::<LittleEndian>()?),
        4 => Value::Int64(r.read_i64::<LittleEndian>()?),
        5 => Value::UInt64(r.read_u64::<LittleEndian>()?),
        6 => Value::Float32(r.read_f32::<LittleEndian>()?),
        7 => Value::Float64(r.read_f64::<LittleEndian>()?),
        8 => Value::Bytes(read_bytes(r)?),
        9 => Value::Date(r.read_i32::<LittleEndian>()?),
        t => return Err(DmError::Encoding(format!("unknown value tag {t}"))),
    })
}

pub fn encode_values(values: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * 9 + 8);
    write_varint(&mut out, values.len() as u64);
    for v in values {
        write_value(&mut out, v)?;
    }
    Ok(out)
}

pub fn decode_values(data: &[u8]) -> Result<Vec<Value>> {
    let mut cur = Cursor::new(data);
    let n = read_count(&mut cur, 1, "value")?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_value(&mut cur)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for v in [0u64, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(read_varint(&mut Cursor::new(&buf)).unwrap(), v);
        }
        let mut one = Vec::new();
        write_varint(&mut one, 127);
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn mixed_column_block() {
        let values = vec![
            Value::Int64(-7),
            Value::Null,
            Value::Bytes(b"pingcap".to_vec()),
            Value::Float64(0.25),
            Value::UInt64(u64::MAX),
        ];
        let data = encode_values(&values).unwrap();
        assert_eq!(decode_values(&data).unwrap(), values);
    }

    #[test]
    fn unknown_tag_is_encoding_error() {
        let mut data = Vec::new();
        write_varint(&mut data, 1);
        data.push(0xee);
        assert!(matches!(decode_values(&data), Err(DmError::Encoding(_))));
    }

    #[test]
    fn oversized_lengths_are_corruption() {
        let mut data = Vec::new();
        write_varint(&mut data, 1 << 62);
        data.push(4);
        assert!(matches!(decode_values(&data), Err(DmError::Corruption(_))));

        let mut bytes = Vec::new();
        write_varint(&mut bytes, u64::MAX >> 1);
        bytes.extend_from_slice(b"abc");
        assert!(matches!(read_bytes(&mut Cursor::new(&bytes)), Err(DmError::Corruption(_))));
    }
}
