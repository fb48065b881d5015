#![forbid(unsafe_code)]
//! txsum: out-of-core daily transaction summary over partitioned Parquet.
//!
//! Facade over the workspace crates; the `txsum` binary lives in `txsum-cli`.

pub use txsum_core as core;
pub use txsum_exec as exec;
pub use txsum_io as io;
pub use txsum_mem as mem;
pub use txsum_operators as operators;

pub use txsum_core::config::PipelineConfig;
pub use txsum_core::manifest::RunManifest;
pub use txsum_exec::{Engine, RunError, Stage};
