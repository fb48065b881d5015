use std::time::Duration;

use thiserror::Error;

/// Result type local to txsum-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("memory budget error: {0}")]
    Budget(String),

    #[error("spill storage error: {0}")]
    Storage(String),

    #[error("spill {what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("unsupported codec: {0}")]
    CodecUnsupported(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("checksum mismatch for segment '{path}'")]
    ChecksumMismatch { path: String },

    #[error("corrupt segment: {0}")]
    Corrupt(String),

    #[error("spill operation cancelled")]
    Cancelled,
}
