//! Run metrics and the end-of-run summary event.
//!
//! Only `tracing` events are emitted here; wiring them to a metrics backend
//! is left to the binary layer.

use txsum_core::manifest::{RunManifest, RunMetrics};
use txsum_operators::AggregateStats;

pub(crate) fn run_metrics(partitions: u64, stats: AggregateStats, output_rows: u64) -> RunMetrics {
    RunMetrics {
        partitions,
        batches: stats.batches,
        rows_read: stats.rows,
        rows_skipped: stats.rows_skipped,
        spills: stats.spills,
        segments_merged: stats.segments_merged,
        peak_state_bytes: stats.peak_state_bytes,
        output_rows,
    }
}

/// One structured event with everything an operator needs from a finished run.
pub fn emit_run_summary(manifest: &RunManifest) {
    let m = &manifest.metrics;
    tracing::info!(
        run = %manifest.id.0,
        duration_ms = manifest.duration_ms(),
        partitions = m.partitions,
        batches = m.batches,
        rows_read = m.rows_read,
        rows_skipped = m.rows_skipped,
        spills = m.spills,
        segments_merged = m.segments_merged,
        peak_state_bytes = m.peak_state_bytes,
        output_rows = m.output_rows,
        config_hash = %manifest.config_hash,
        "run finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_stats_carry_over() {
        let stats = AggregateStats {
            batches: 10,
            rows: 1_000,
            rows_skipped: 3,
            spills: 3,
            segments_merged: 3,
            peak_state_bytes: 4_096,
        };
        let m = run_metrics(2, stats, 31);
        assert_eq!(m.partitions, 2);
        assert_eq!(m.rows_read, 1_000);
        assert_eq!(m.spills, 3);
        assert_eq!(m.output_rows, 31);
    }
}
