//! Compression facade for spill segments.
//!
//! `None` is always available. `Zstd` and `Lz4` need their cargo features.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Codec {
    #[default]
    None = 0,
    Zstd = 1,
    Lz4 = 2,
}

#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

impl Codec {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zstd),
            2 => Ok(Codec::Lz4),
            other => Err(Error::CodecUnsupported(format!("codec tag {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
        }
    }

    /// Whether this build can actually encode/decode with the codec.
    pub fn is_available(self) -> bool {
        match self {
            Codec::None => true,
            Codec::Zstd => cfg!(feature = "zstd"),
            Codec::Lz4 => cfg!(feature = "lz4"),
        }
    }

    pub fn compress(self, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(input.to_vec()),
            #[cfg(feature = "zstd")]
            Codec::Zstd => zstd::bulk::compress(input, ZSTD_LEVEL)
                .map_err(|e| Error::Codec(format!("zstd: {e}"))),
            #[cfg(feature = "lz4")]
            Codec::Lz4 => Ok(lz4_flex::compress_prepend_size(input)),
            #[allow(unreachable_patterns)]
            other => Err(Error::CodecUnsupported(other.name().to_string())),
        }
    }

    pub fn decompress(self, input: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Codec::None => input.to_vec(),
            #[cfg(feature = "zstd")]
            Codec::Zstd => zstd::bulk::decompress(input, uncompressed_len)
                .map_err(|e| Error::Codec(format!("zstd: {e}")))?,
            #[cfg(feature = "lz4")]
            Codec::Lz4 => lz4_flex::decompress_size_prepended(input)
                .map_err(|e| Error::Codec(format!("lz4: {e}")))?,
            #[allow(unreachable_patterns)]
            other => return Err(Error::CodecUnsupported(other.name().to_string())),
        };
        if out.len() != uncompressed_len {
            return Err(Error::Corrupt(format!(
                "decoded {} bytes, header says {}",
                out.len(),
                uncompressed_len
            )));
        }
        Ok(out)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let codec = match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Codec::None,
            "zstd" => Codec::Zstd,
            "lz4" => Codec::Lz4,
            other => return Err(Error::CodecUnsupported(other.to_string())),
        };
        if !codec.is_available() {
            return Err(Error::CodecUnsupported(format!(
                "{} (build without the '{}' feature)",
                codec.name(),
                codec.name()
            )));
        }
        Ok(codec)
    }
}
