#![forbid(unsafe_code)]
//! txsum-io: the IO edges of the pipeline.
//!
//! - `location`: parse `scheme://bucket/prefix/**/*.parquet` patterns
//! - `remote`: object store construction, failure classification, retry
//! - `readers::parquet`: Arrow record batches to `RowBatch`
//! - `source`: `PartitionedSource`, the prefetching `BatchSource`
//! - `storage`: `Storage` backends for spill segments
//! - `writers::csv`: atomic CSV export of the summary table

pub mod error;
pub mod location;
pub mod memory_storage;
pub mod readers;
pub mod remote;
pub mod source;
pub mod storage;
pub mod writers;

pub use error::{Error, Result};
pub use location::{Location, Scheme};
pub use memory_storage::MemoryStorage;
pub use source::{PartitionInfo, PartitionedSource};
pub use storage::FsStorage;
pub use writers::csv::{write_summary_csv, CsvSummaryWriter};
