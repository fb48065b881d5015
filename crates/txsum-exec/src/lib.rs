#![forbid(unsafe_code)]
//! txsum-exec: the pipeline runtime.
//!
//! `Engine::run` opens the configured source, drives projection and the
//! spilling aggregation on one thread, writes the CSV atomically and returns
//! a `RunManifest`. Failures come back as `RunError`, tagged with the stage
//! that raised them.

pub mod metrics;
pub mod runtime;

pub use runtime::{Engine, RunError, Stage};
