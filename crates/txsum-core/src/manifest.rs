//! Run manifest for audit and idempotence checks.
//!
//! Two runs over the same partition inventory with the same config must
//! report the same `outputs_digest`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(pub Uuid);

/// Counters collected over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub partitions: u64,
    pub batches: u64,
    pub rows_read: u64,
    pub rows_skipped: u64,
    pub spills: u64,
    pub segments_merged: u64,
    pub peak_state_bytes: u64,
    pub output_rows: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub id: ManifestId,

    /// Stable hash of the effective pipeline config.
    pub config_hash: Hash256,

    /// Engine version string for provenance.
    pub engine_version: String,

    /// Digest of the partition inventory (paths, sizes, etags).
    pub inputs_digest: Option<Hash256>,

    /// Digest of the output file bytes.
    pub outputs_digest: Option<Hash256>,

    pub output_path: String,

    pub metrics: RunMetrics,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RunManifest {
    pub fn new(config_hash: Hash256, output_path: impl Into<String>, started_ms: u64) -> Self {
        Self {
            id: ManifestId(Uuid::new_v4()),
            config_hash,
            engine_version: crate::VERSION.to_string(),
            inputs_digest: None,
            outputs_digest: None,
            output_path: output_path.into(),
            metrics: RunMetrics::default(),
            started_ms,
            finished_ms: started_ms,
        }
    }

    pub fn finish(
        mut self,
        finished_ms: u64,
        metrics: RunMetrics,
        outputs_digest: Option<Hash256>,
    ) -> Self {
        self.finished_ms = finished_ms;
        self.metrics = metrics;
        self.outputs_digest = outputs_digest;
        self
    }

    pub fn duration_ms(&self) -> u64 {
        self.finished_ms.saturating_sub(self.started_ms)
    }
}
