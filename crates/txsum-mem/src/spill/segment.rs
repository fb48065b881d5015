//! Segment file header and handle.
//!
//! Layout on disk:
//! [ magic: u32 ][ version: u16 ][ codec: u8 ][ reserved: u8 ]
//! [ entry_count: u64 ][ uncompressed_len: u64 ][ compressed_len: u64 ]
//! [ payload bytes ... ]
//!
//! The payload is a JSON array of `(BucketKey, AggregateState)` pairs in
//! ascending key order. A blake3 checksum over (header || payload) is kept in
//! the handle and verified on read.

use serde::{Deserialize, Serialize};
use txsum_core::aggregate::BucketKey;
use txsum_core::id::SpillId;

use super::Codec;
use crate::error::{Error, Result};

pub const MAGIC: u32 = u32::from_le_bytes(*b"TXSG");
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 8 + 8 + 8;

/// Upper bound on a single segment payload. Anything larger is corruption.
pub const MAX_SEGMENT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub codec: Codec,
    pub entry_count: u64,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl SegmentHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[6] = self.codec as u8;
        out[8..16].copy_from_slice(&self.entry_count.to_le_bytes());
        out[16..24].copy_from_slice(&self.uncompressed_len.to_le_bytes());
        out[24..32].copy_from_slice(&self.compressed_len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Corrupt(format!(
                "header is {} bytes, need {HEADER_LEN}",
                bytes.len()
            )));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if magic != MAGIC {
            return Err(Error::Corrupt(format!("bad magic {magic:#010x}")));
        }
        if version != VERSION {
            return Err(Error::Corrupt(format!("unsupported segment version {version}")));
        }
        let header = Self {
            codec: Codec::from_u8(bytes[6])?,
            entry_count: le_u64(bytes, 8),
            uncompressed_len: le_u64(bytes, 16),
            compressed_len: le_u64(bytes, 24),
        };
        header.validate_sizes()?;
        Ok(header)
    }

    /// Reject sizes that would cause absurd allocations.
    pub fn validate_sizes(&self) -> Result<()> {
        if self.uncompressed_len > MAX_SEGMENT_BYTES || self.compressed_len > MAX_SEGMENT_BYTES {
            return Err(Error::Corrupt(format!(
                "segment lengths {}/{} exceed {MAX_SEGMENT_BYTES}",
                self.uncompressed_len, self.compressed_len
            )));
        }
        if self.codec == Codec::None && self.compressed_len != self.uncompressed_len {
            return Err(Error::Corrupt("uncompressed segment with mismatched lengths".into()));
        }
        Ok(())
    }
}

/// What the engine keeps in memory for a segment it spilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHandle {
    pub id: SpillId,
    pub path: String,
    pub codec: Codec,
    pub entry_count: u64,
    pub uncompressed_len: u64,
    pub compressed_len: u64,
    pub checksum: [u8; 32],
    /// Smallest and largest bucket in the segment, for logging.
    pub key_range: Option<(BucketKey, BucketKey)>,
}

impl SegmentHandle {
    pub fn total_len(&self) -> u64 {
        HEADER_LEN as u64 + self.compressed_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bytes_parse_back() {
        let h = SegmentHeader {
            codec: Codec::None,
            entry_count: 3,
            uncompressed_len: 120,
            compressed_len: 120,
        };
        let bytes = h.to_bytes();
        assert_eq!(&bytes[0..4], b"TXSG");
        assert_eq!(SegmentHeader::from_bytes(&bytes).unwrap(), h);
    }

    #[test]
    fn rejects_foreign_magic_and_short_input() {
        let mut bytes = SegmentHeader {
            codec: Codec::None,
            entry_count: 0,
            uncompressed_len: 2,
            compressed_len: 2,
        }
        .to_bytes();
        assert!(SegmentHeader::from_bytes(&bytes[..10]).is_err());
        bytes[0] = b'X';
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(Error::Corrupt(_))
        ));
    }
}
