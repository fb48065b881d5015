#![forbid(unsafe_code)]
//! txsum-operators: the per-batch stages of the pipeline.
//!
//! - `project`: derive the date bucket of every row
//! - `aggregate`: hash aggregation that spills under memory pressure
//! - `sort`: finalize state into ordered result rows
//!
//! Everything here is synchronous; fetching happens in `txsum-io`.

pub mod aggregate;
pub mod footprint;
pub mod project;
pub mod sort;

pub use aggregate::{AggPhase, AggregateStats, HashAggregator};
pub use footprint::{Footprint, ENTRY_FOOTPRINT_BYTES};
pub use project::{KeyedBatch, SchemaProjector};
pub use sort::{finalize, summary_order};
