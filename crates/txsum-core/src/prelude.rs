//! Convenient re-exports for downstream crates.

pub use crate::aggregate::{AggregateState, BucketKey, PartialAggregate, ResultRow, SummaryTable};
pub use crate::cancel::CancelToken;
pub use crate::config::{PipelineConfig, SourceConfig, TimestampPolicy};
pub use crate::error::{Error, Result, SourceFailure};
pub use crate::id::{BatchId, SpillId};
pub use crate::manifest::{ManifestId, RunManifest, RunMetrics};
pub use crate::schema::{DataType, Field, Schema};
pub use crate::source::{BatchSource, VecSource};
pub use crate::types::{Batch, Column, RowBatch, Scalar};
