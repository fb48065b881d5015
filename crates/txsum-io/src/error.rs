use thiserror::Error;

/// Result type local to txsum-io.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid location '{location}': {reason}")]
    Location { location: String, reason: String },

    #[error("config error: {0}")]
    Config(String),
}

impl From<Error> for txsum_core::error::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Location { .. } | Error::Config(_) => {
                txsum_core::error::Error::Config(err.to_string())
            }
            Error::Io(_) | Error::Csv(_) => {
                txsum_core::error::Error::OutputWriteFailed(err.to_string())
            }
        }
    }
}
