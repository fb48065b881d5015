//! Hash aggregation by day with spill-to-disk under memory pressure.
//!
//! After every batch the estimated resident size is charged to the memory
//! budget. When the budget refuses, the whole in-memory table is persisted as
//! one spill segment and the table starts over empty. Segments are only read
//! back once, when the input is exhausted and `finish` merges them.

use txsum_core::aggregate::{amount_to_fixed, qty_to_i128, PartialAggregate};
use txsum_core::budget::MemoryBudget;
use txsum_core::cancel::CancelToken;
use txsum_core::error::{Error, Result};
use txsum_core::schema::{CUSTOMER_ID, ORDER_AMOUNT, ORDER_QTY, TRANSACTION_ID};
use txsum_core::types::Column;
use txsum_mem::error::Error as MemError;
use txsum_mem::{BudgetGuardImpl, MemoryBudgetImpl, PeakTracker, SegmentHandle, SpillManager};

use crate::footprint::Footprint;
use crate::project::KeyedBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggPhase {
    Accumulating,
    Spilling,
    Draining,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub batches: u64,
    pub rows: u64,
    pub rows_skipped: u64,
    pub spills: u64,
    pub segments_merged: u64,
    pub peak_state_bytes: u64,
}

fn spill_write_failed(e: MemError) -> Error {
    match e {
        MemError::Cancelled => Error::Cancelled,
        other => Error::SpillWriteFailed(other.to_string()),
    }
}

fn spill_merge_failed(e: MemError) -> Error {
    match e {
        MemError::Cancelled => Error::Cancelled,
        other => Error::SpillMergeFailed(other.to_string()),
    }
}

fn required<'a>(keyed: &'a KeyedBatch, name: &str) -> Result<&'a Column> {
    keyed.batch.rows.column(name).ok_or_else(|| {
        Error::schema_mismatch(
            &*keyed.batch.partition,
            format!("missing required column '{name}'"),
        )
    })
}

pub struct HashAggregator {
    phase: AggPhase,
    state: PartialAggregate,
    guard: BudgetGuardImpl,
    spill: SpillManager,
    segments: Vec<SegmentHandle>,
    amount_scale: u32,
    footprint: Footprint,
    peak: PeakTracker,
    stats: AggregateStats,
    cancel: CancelToken,
}

impl HashAggregator {
    pub fn new(
        budget: &MemoryBudgetImpl,
        spill: SpillManager,
        amount_scale: u32,
        cancel: CancelToken,
    ) -> Result<Self> {
        let guard = budget
            .try_acquire(0, "aggregate_state")
            .ok_or_else(|| Error::Invariant("empty budget guard refused".into()))?;
        Ok(Self {
            phase: AggPhase::Accumulating,
            state: PartialAggregate::new(),
            guard,
            spill,
            segments: Vec::new(),
            amount_scale,
            footprint: Footprint::default(),
            peak: PeakTracker::new(),
            stats: AggregateStats::default(),
            cancel,
        })
    }

    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = footprint;
        self
    }

    pub fn phase(&self) -> AggPhase {
        self.phase
    }

    pub fn stats(&self) -> AggregateStats {
        AggregateStats {
            peak_state_bytes: self.peak.peak() as u64,
            ..self.stats
        }
    }

    /// Entries currently held in memory.
    pub fn resident_entries(&self) -> usize {
        self.state.len()
    }

    pub fn segments(&self) -> &[SegmentHandle] {
        &self.segments
    }

    pub fn spill_manager(&self) -> &SpillManager {
        &self.spill
    }

    /// Fold one keyed batch into the table, spilling if the budget refuses
    /// the grown table.
    pub fn consume(&mut self, keyed: &KeyedBatch) -> Result<()> {
        if self.phase != AggPhase::Accumulating {
            return Err(Error::Invariant(format!(
                "batch {} arrived while {:?}",
                keyed.batch.id, self.phase
            )));
        }
        self.cancel.check()?;

        self.accumulate(keyed)?;
        self.stats.batches += 1;
        self.stats.rows += keyed.num_rows() as u64;
        self.stats.rows_skipped += keyed.skipped as u64;

        let wanted = self.footprint.estimate(self.state.len());
        self.peak.record(wanted);
        if !self.guard.try_resize(wanted) {
            tracing::debug!(
                batch = %keyed.batch.id,
                entries = self.state.len(),
                wanted,
                "memory budget refused aggregate state"
            );
            self.spill_state()?;
        }
        Ok(())
    }

    fn accumulate(&mut self, keyed: &KeyedBatch) -> Result<()> {
        let tx = required(keyed, TRANSACTION_ID)?;
        let customer = required(keyed, CUSTOMER_ID)?;
        let amount = required(keyed, ORDER_AMOUNT)?;
        let qty = required(keyed, ORDER_QTY)?;
        let partition = &*keyed.batch.partition;

        for (row, key) in keyed.keys.iter().enumerate() {
            let Some(key) = key else { continue };
            let row_amount = amount_to_fixed(&amount.values[row], self.amount_scale)
                .map_err(|m| Error::schema_mismatch(partition, format!("order_amount: {m}")))?;
            let row_qty = qty_to_i128(&qty.values[row])
                .map_err(|m| Error::schema_mismatch(partition, format!("order_qty: {m}")))?;

            let state = self.state.entry_mut(*key);
            if !tx.values[row].is_null() {
                state.transaction_count += 1;
            }
            if !customer.values[row].is_null() {
                state.customer_count += 1;
            }
            state.total_order_amount += row_amount;
            state.total_order_qty += row_qty;
        }
        Ok(())
    }

    fn spill_state(&mut self) -> Result<()> {
        self.phase = AggPhase::Spilling;
        self.cancel.check()?;

        let handle = self.spill.persist(&self.state).map_err(spill_write_failed)?;
        tracing::info!(
            segment = %handle.id,
            entries = handle.entry_count,
            bytes = handle.total_len(),
            "spilled aggregate state"
        );
        self.segments.push(handle);
        self.state = PartialAggregate::new();
        self.guard.try_resize(0);
        self.stats.spills += 1;

        self.phase = AggPhase::Accumulating;
        Ok(())
    }

    /// Merge every spilled segment with the resident table.
    ///
    /// Moves to `Draining`; no further batches are accepted.
    pub fn finish(&mut self) -> Result<PartialAggregate> {
        if self.phase == AggPhase::Draining {
            return Err(Error::Invariant("aggregator already drained".into()));
        }
        self.phase = AggPhase::Draining;
        self.cancel.check()?;

        let residual = self.state.take();
        let segments = std::mem::take(&mut self.segments);
        let merged_segments = segments.len() as u64;
        let merged = self
            .spill
            .merge_all(segments, residual, &self.cancel)
            .map_err(spill_merge_failed)?;

        self.stats.segments_merged = merged_segments;
        self.guard.try_resize(0);
        tracing::debug!(
            buckets = merged.len(),
            segments = merged_segments,
            "aggregation drained"
        );
        Ok(merged)
    }
}
