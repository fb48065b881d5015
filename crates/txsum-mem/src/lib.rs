#![forbid(unsafe_code)]
//! txsum-mem: memory budgeting and the spill manager for aggregate state.
//!
//! This crate provides the concrete implementations for the interfaces in
//! `txsum-core::budget`. The aggregation engine charges its resident state
//! here and, when refused, hands the state to the `SpillManager`.
//!
//! No object-store IO lives here. A generic `Storage` trait is exposed
//! (in `spill::`) and implemented by `txsum-io`.

pub mod error;
pub mod guard;
pub mod spill;
pub mod tracking;

pub use guard::{BudgetGuardImpl, MemoryBudgetImpl};
pub use spill::{Codec, SegmentHandle, SpillManager, Storage};
pub use tracking::PeakTracker;
