#![forbid(unsafe_code)]
//! txsum-core: shared vocabulary for the daily transaction summary pipeline.
//!
//! Pure data and small helpers only: configuration, the error taxonomy,
//! strongly-typed IDs, the lightweight row batch model, per-day aggregate
//! state with its merge rule, and the run manifest. No I/O lives here.

pub mod aggregate;
pub mod budget;
pub mod cancel;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod manifest;
pub mod prelude;
pub mod schema;
pub mod source;
pub mod types;

/// Engine version string recorded in run manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
