use std::fmt;

use thiserror::Error;

use crate::id::BatchId;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

/// Why the remote dataset could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFailure {
    /// The bucket, prefix or object does not exist (or matched nothing).
    NotFound,
    /// Credentials are missing, invalid or lack read permission.
    AccessDenied,
    /// Transport-level failure talking to the store.
    Network,
    /// A remote operation exceeded the configured fetch timeout.
    Timeout,
}

impl SourceFailure {
    pub fn is_retryable(self) -> bool {
        matches!(self, SourceFailure::Network | SourceFailure::Timeout)
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceFailure::NotFound => "not found",
            SourceFailure::AccessDenied => "access denied",
            SourceFailure::Network => "network error",
            SourceFailure::Timeout => "timed out",
        };
        f.write_str(s)
    }
}

/// Pipeline error taxonomy shared by every stage.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("source unavailable ({kind}) at '{location}': {message}")]
    SourceUnavailable {
        kind: SourceFailure,
        location: String,
        message: String,
    },

    #[error("schema mismatch in '{partition}': {message}")]
    SchemaMismatch { partition: String, message: String },

    #[error("invalid timestamp '{raw}' in {batch} of '{partition}'")]
    InvalidTimestamp {
        raw: String,
        batch: BatchId,
        partition: String,
    },

    #[error("spill write failed: {0}")]
    SpillWriteFailed(String),

    #[error("spill merge failed: {0}")]
    SpillMergeFailed(String),

    #[error("output write failed: {0}")]
    OutputWriteFailed(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl Error {
    pub fn source_unavailable(
        kind: SourceFailure,
        location: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::SourceUnavailable {
            kind,
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn schema_mismatch(partition: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SchemaMismatch {
            partition: partition.into(),
            message: message.into(),
        }
    }

    /// Only transient source failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SourceUnavailable { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
