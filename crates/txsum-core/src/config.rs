//! Pipeline configuration that downstream crates can serialize/deserialize.
//!
//! Layering (lowest to highest priority): `Default`, `from_env`, a YAML file
//! applied by the CLI, then explicit CLI flags.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::MAX_AMOUNT_SCALE;
use crate::error::{Error, Result};

/// What to do with a row whose `datetime` cannot be turned into a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    /// Fail the run on the first bad value.
    #[default]
    Abort,
    /// Drop the row, count it and log it.
    Skip,
}

impl FromStr for TimestampPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(TimestampPolicy::Abort),
            "skip" => Ok(TimestampPolicy::Skip),
            other => Err(Error::Config(format!(
                "unknown timestamp policy '{other}' (expected 'abort' or 'skip')"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// `scheme://bucket/prefix/**/*.parquet`, `file:///dir/**/*.parquet` or a bare path.
    pub source_location: String,

    /// Maximum rows per decoded batch.
    pub batch_size: usize,

    /// Budget (bytes) for resident aggregation state before spilling.
    pub memory_budget_bytes: usize,

    /// Directory for spill segments; each run uses its own subdirectory.
    pub spill_dir: String,

    /// Spill segment compression: `none`, `zstd` or `lz4`.
    pub spill_codec: String,

    pub timestamp_policy: TimestampPolicy,

    /// chrono format for string-encoded `datetime` values.
    pub timestamp_format: String,

    /// Decimal digits kept for `total_order_amount`.
    pub amount_scale: u32,

    pub output_path: String,

    /// Partition files fetched/decoded concurrently.
    pub fetch_concurrency: usize,

    /// Decoded batches buffered per in-flight partition.
    pub prefetch_depth: usize,

    pub fetch_timeout_ms: u64,
    pub spill_timeout_ms: u64,

    /// Retry policy for transient source failures.
    pub retry_max_retries: usize,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,

    /// Region hint for S3 sources; credentials stay ambient.
    pub aws_region: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_location: "s3://confessions-of-a-data-guy/transactions/**/*.parquet"
                .to_string(),
            batch_size: 200_000,
            memory_budget_bytes: 512 * 1024 * 1024, // 512 MiB default
            spill_dir: "./txsum_spill".to_string(),
            spill_codec: "none".to_string(),
            timestamp_policy: TimestampPolicy::Abort,
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            amount_scale: 6,
            output_path: "daily_transactions_summary.csv".to_string(),
            fetch_concurrency: 4,
            prefetch_depth: 2,
            fetch_timeout_ms: 60_000,
            spill_timeout_ms: 60_000,
            retry_max_retries: 3,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 5_000,
            aws_region: None,
        }
    }
}

/// Snapshot of the settings the IO layer needs to open the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub location: String,
    pub batch_size: usize,
    pub fetch_concurrency: usize,
    pub prefetch_depth: usize,
    pub fetch_timeout: Duration,
    pub retry_max_retries: usize,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub aws_region: Option<String>,
}

impl PipelineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `TXSUM_SOURCE`: source location pattern
    /// - `TXSUM_BATCH_SIZE`: rows per batch
    /// - `TXSUM_MEMORY_BUDGET_BYTES`: aggregation memory budget
    /// - `TXSUM_SPILL_DIR`, `TXSUM_SPILL_CODEC`
    /// - `TXSUM_TIMESTAMP_POLICY` (`abort`/`skip`), `TXSUM_TIMESTAMP_FORMAT`
    /// - `TXSUM_AMOUNT_SCALE`, `TXSUM_OUTPUT`
    /// - `TXSUM_FETCH_CONCURRENCY`, `TXSUM_PREFETCH_DEPTH`
    /// - `TXSUM_FETCH_TIMEOUT_MS`, `TXSUM_SPILL_TIMEOUT_MS`
    /// - `TXSUM_RETRY_MAX_RETRIES`, `TXSUM_RETRY_INITIAL_MS`, `TXSUM_RETRY_MAX_MS`
    /// - `AWS_REGION` / `AWS_DEFAULT_REGION`
    ///
    /// Unparseable numeric values are ignored, as are unknown policies.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` over an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        fn parsed<T: FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.trim().parse::<T>().ok())
        }

        if let Some(s) = get("TXSUM_SOURCE") {
            cfg.source_location = s;
        }
        if let Some(v) = parsed(get("TXSUM_BATCH_SIZE")) {
            cfg.batch_size = v;
        }
        if let Some(v) = parsed(get("TXSUM_MEMORY_BUDGET_BYTES")) {
            cfg.memory_budget_bytes = v;
        }
        if let Some(s) = get("TXSUM_SPILL_DIR") {
            cfg.spill_dir = s;
        }
        if let Some(s) = get("TXSUM_SPILL_CODEC") {
            cfg.spill_codec = s;
        }
        if let Some(v) = parsed(get("TXSUM_TIMESTAMP_POLICY")) {
            cfg.timestamp_policy = v;
        }
        if let Some(s) = get("TXSUM_TIMESTAMP_FORMAT") {
            cfg.timestamp_format = s;
        }
        if let Some(v) = parsed(get("TXSUM_AMOUNT_SCALE")) {
            cfg.amount_scale = v;
        }
        if let Some(s) = get("TXSUM_OUTPUT") {
            cfg.output_path = s;
        }
        if let Some(v) = parsed(get("TXSUM_FETCH_CONCURRENCY")) {
            cfg.fetch_concurrency = v;
        }
        if let Some(v) = parsed(get("TXSUM_PREFETCH_DEPTH")) {
            cfg.prefetch_depth = v;
        }
        if let Some(v) = parsed(get("TXSUM_FETCH_TIMEOUT_MS")) {
            cfg.fetch_timeout_ms = v;
        }
        if let Some(v) = parsed(get("TXSUM_SPILL_TIMEOUT_MS")) {
            cfg.spill_timeout_ms = v;
        }
        if let Some(v) = parsed(get("TXSUM_RETRY_MAX_RETRIES")) {
            cfg.retry_max_retries = v;
        }
        if let Some(v) = parsed(get("TXSUM_RETRY_INITIAL_MS")) {
            cfg.retry_initial_backoff_ms = v;
        }
        if let Some(v) = parsed(get("TXSUM_RETRY_MAX_MS")) {
            cfg.retry_max_backoff_ms = v;
        }
        if let Some(region) = get("AWS_REGION").or_else(|| get("AWS_DEFAULT_REGION")) {
            cfg.aws_region = Some(region);
        }

        cfg
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.source_location.trim().is_empty() {
            return fail("source_location must not be empty");
        }
        if self.output_path.trim().is_empty() {
            return fail("output_path must not be empty");
        }
        if self.spill_dir.trim().is_empty() {
            return fail("spill_dir must not be empty");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1");
        }
        if self.fetch_concurrency == 0 {
            return fail("fetch_concurrency must be at least 1");
        }
        if self.prefetch_depth == 0 {
            return fail("prefetch_depth must be at least 1");
        }
        if self.fetch_timeout_ms == 0 || self.spill_timeout_ms == 0 {
            return fail("timeouts must be positive");
        }
        if self.amount_scale > MAX_AMOUNT_SCALE {
            return Err(Error::Config(format!(
                "amount_scale {} exceeds the maximum of {MAX_AMOUNT_SCALE}",
                self.amount_scale
            )));
        }
        if self.timestamp_format.trim().is_empty() {
            return fail("timestamp_format must not be empty");
        }
        Ok(())
    }

    pub fn spill_timeout(&self) -> Duration {
        Duration::from_millis(self.spill_timeout_ms)
    }

    /// Produce the source configuration snapshot used by the IO layer.
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            location: self.source_location.clone(),
            batch_size: self.batch_size,
            fetch_concurrency: self.fetch_concurrency,
            prefetch_depth: self.prefetch_depth,
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            retry_max_retries: self.retry_max_retries,
            retry_initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            retry_max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            aws_region: self.aws_region.clone(),
        }
    }
}
