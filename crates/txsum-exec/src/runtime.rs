//! Runtime: drive the pull loop from source to CSV and emit a RunManifest.
//!
//! - Opens the partitioned source (or takes any `BatchSource`).
//! - Projects, aggregates and spills batch by batch on the calling thread.
//! - Drains the aggregator, sorts and writes the CSV atomically.
//! - Tags every failure with the stage that raised it.
//!
//! Each run spills into its own `run-<uuid>` directory, removed once the
//! aggregation is drained or has failed.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use txsum_core::aggregate::PartialAggregate;
use txsum_core::cancel::CancelToken;
use txsum_core::config::PipelineConfig;
use txsum_core::error::Error;
use txsum_core::hash::{hash_serde, Hash256};
use txsum_core::manifest::RunManifest;
use txsum_core::source::BatchSource;

use txsum_io::storage::{local_spill_path, spill_storage_for};
use txsum_io::{write_summary_csv, PartitionedSource};
use txsum_mem::{Codec, MemoryBudgetImpl, SpillManager};
use txsum_operators::{finalize, HashAggregator, SchemaProjector};

use crate::metrics::{emit_run_summary, run_metrics};

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Config,
    Source,
    Project,
    Aggregate,
    Spill,
    Merge,
    Export,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Source => "source",
            Stage::Project => "project",
            Stage::Aggregate => "aggregate",
            Stage::Spill => "spill",
            Stage::Merge => "merge",
            Stage::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {error}")]
pub struct RunError {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl RunError {
    pub fn new(stage: Stage, error: Error) -> Self {
        Self { stage, error }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Error::Cancelled)
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, RunError>;
}

impl<T, E: Into<Error>> AtStage<T> for Result<T, E> {
    fn at(self, stage: Stage) -> Result<T, RunError> {
        self.map_err(|e| RunError::new(stage, e.into()))
    }
}

/// Spill write failures surface during `consume`, but belong to the spill stage.
fn consume_stage(e: &Error) -> Stage {
    match e {
        Error::SpillWriteFailed(_) => Stage::Spill,
        _ => Stage::Aggregate,
    }
}

/// What a drained pull loop hands to the export stage.
struct Drained {
    state: PartialAggregate,
    partitions: u64,
}

/// Engine owns the run configuration and its cancel token.
pub struct Engine {
    cfg: PipelineConfig,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self {
            cfg,
            cancel: CancelToken::new(),
        }
    }

    /// Share an externally owned token (signal handlers, tests).
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Open the configured source and run the whole pipeline.
    pub fn run(&self) -> Result<RunManifest, RunError> {
        self.cfg.validate().at(Stage::Config)?;
        let span = tracing::info_span!("run", source = %self.cfg.source_location);
        let _enter = span.enter();

        let source =
            PartitionedSource::open(&self.cfg.source_config(), self.cancel.clone()).at(Stage::Source)?;
        tracing::info!(
            location = %source.location(),
            partitions = source.partition_count(),
            "source opened"
        );
        let inventory = source.inventory_digest();
        self.execute(source, Some(inventory))
    }

    /// Run the pipeline over an already constructed source.
    ///
    /// The manifest carries no inventory digest.
    pub fn run_with_source<S: BatchSource>(&self, source: S) -> Result<RunManifest, RunError> {
        self.cfg.validate().at(Stage::Config)?;
        let span = tracing::info_span!("run", source = "custom");
        let _enter = span.enter();
        self.execute(source, None)
    }

    fn execute<S: BatchSource>(
        &self,
        mut source: S,
        inventory: Option<Hash256>,
    ) -> Result<RunManifest, RunError> {
        let started_ms = now_millis();
        let config_hash = hash_serde(&self.cfg).at(Stage::Config)?;
        let mut manifest = RunManifest::new(config_hash, self.cfg.output_path.clone(), started_ms);
        manifest.inputs_digest = inventory;

        let codec = Codec::from_str(&self.cfg.spill_codec)
            .map_err(|e| Error::Config(e.to_string()))
            .at(Stage::Config)?;
        let storage = spill_storage_for(&self.cfg.spill_dir).at(Stage::Config)?;
        let run_dir = run_spill_dir(&self.cfg.spill_dir);
        tracing::debug!(dir = %run_dir, codec = %codec, "spill directory for this run");

        let spill = SpillManager::new(storage, codec, run_dir, self.cfg.spill_timeout());
        let budget = MemoryBudgetImpl::new(self.cfg.memory_budget_bytes);
        let mut agg = HashAggregator::new(
            &budget,
            spill,
            self.cfg.amount_scale,
            self.cancel.clone(),
        )
        .at(Stage::Aggregate)?;
        let mut projector =
            SchemaProjector::new(self.cfg.timestamp_format.clone(), self.cfg.timestamp_policy);

        let drained = self.pump(&mut source, &mut projector, &mut agg);
        drop(source);
        agg.spill_manager().cleanup();
        let drained = drained?;

        self.cancel.check().at(Stage::Export)?;
        let table = finalize(drained.state, self.cfg.amount_scale);
        let digest = write_summary_csv(&table, Path::new(&self.cfg.output_path)).at(Stage::Export)?;
        tracing::info!(
            path = %self.cfg.output_path,
            rows = table.rows.len(),
            digest = %digest,
            "summary written"
        );

        let metrics = run_metrics(drained.partitions, agg.stats(), table.rows.len() as u64);
        let manifest = manifest.finish(now_millis(), metrics, Some(digest));
        emit_run_summary(&manifest);
        Ok(manifest)
    }

    /// Pull every batch through projection and aggregation, then drain.
    fn pump<S: BatchSource>(
        &self,
        source: &mut S,
        projector: &mut SchemaProjector,
        agg: &mut HashAggregator,
    ) -> Result<Drained, RunError> {
        let mut partitions = 0u64;
        let mut current: Option<Arc<str>> = None;

        while let Some(batch) = source.next_batch().at(Stage::Source)? {
            if current.as_deref() != Some(&*batch.partition) {
                partitions += 1;
                tracing::debug!(partition = %batch.partition, "partition started");
                current = Some(Arc::clone(&batch.partition));
            }
            let keyed = projector.project(batch).at(Stage::Project)?;
            agg.consume(&keyed)
                .map_err(|e| RunError::new(consume_stage(&e), e))?;
        }

        let stats = agg.stats();
        tracing::info!(
            batches = stats.batches,
            rows = stats.rows,
            skipped = stats.rows_skipped,
            spills = stats.spills,
            "source exhausted; draining"
        );
        let state = agg.finish().at(Stage::Merge)?;
        Ok(Drained { state, partitions })
    }
}

fn run_spill_dir(spill_dir: &str) -> String {
    let base = local_spill_path(spill_dir).trim_end_matches('/');
    format!("{base}/run-{}", Uuid::new_v4())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
