//! 压缩/解压（LZ4 / None）
//!
//! 压缩块格式：
//! ```text
//! ┌───────────────────────────────┐
//! │ method      (u8)              │
//! │ uncomp_size (u32 LE)          │
//! │ payload                       │
//! └───────────────────────────────┘
//! ```

use byteorder::{ByteOrder, LittleEndian};
use crate::common::{DmError, Result};

const HEADER_SIZE: usize = 5;
/// LZ4 块格式的压缩比上限
const MAX_LZ4_RATIO: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None,
    Lz4,
}

impl CompressionMethod {
    fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4  => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            t => Err(DmError::Compression(format!("unknown method tag {t}"))),
        }
    }
}

pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    let payload = match method {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| DmError::Compression(e.to_string()))?,
    };
    let mut out = vec![0u8; HEADER_SIZE];
    out[0] = method.tag();
    LittleEndian::write_u32(&mut out[1..HEADER_SIZE], data.len() as u32);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < HEADER_SIZE {
        return Err(DmError::Compression("block shorter than header".into()));
    }
    let method  = CompressionMethod::from_tag(data[0])?;
    let raw_len = LittleEndian::read_u32(&data[1..HEADER_SIZE]) as usize;
    let payload = &data[HEADER_SIZE..];
    if raw_len > payload.len().saturating_mul(MAX_LZ4_RATIO) + HEADER_SIZE {
        return Err(DmError::Compression(format!(
            "header claims {raw_len} raw bytes for a {} byte payload", payload.len()
        )));
    }
    let raw = match method {
        CompressionMethod::None => payload.to_vec(),
        CompressionMethod::Lz4  =>
            lz4::block::decompress(payload, Some(raw_len as i32))
                .map_err(|e| DmError::Compression(e.to_string()))?,
    };
    if raw.len() != raw_len {
        return Err(DmError::Compression(format!(
            "expect {raw_len} bytes after decompress, got {}", raw.len()
        )));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_block_restores_payload() {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i % 17).to_le_bytes()).collect();
        let packed = compress(&data, CompressionMethod::Lz4).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn truncated_block_is_rejected() {
        assert!(decompress(&[1, 0]).is_err());
    }

    #[test]
    fn implausible_raw_length_is_rejected() {
        let mut packed = compress(b"abcd", CompressionMethod::Lz4).unwrap();
        LittleEndian::write_u32(&mut packed[1..HEADER_SIZE], u32::MAX);
        assert!(matches!(decompress(&packed), Err(DmError::Compression(_))));
    }
}
