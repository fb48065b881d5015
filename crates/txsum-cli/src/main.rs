//! txsum CLI: run the daily transaction summary or validate its configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use txsum_core::cancel::CancelToken;
use txsum_core::config::{PipelineConfig, TimestampPolicy};
use txsum_core::error::{Error, SourceFailure};
use txsum_exec::{Engine, RunError, Stage};
use txsum_io::storage::spill_storage_for;
use txsum_io::Location;
use txsum_mem::Codec;

#[derive(Parser)]
#[command(name = "txsum")]
#[command(
    about = "Daily transaction summary over partitioned Parquet, in bounded memory",
    long_about = None
)]
struct Cli {
    /// -v for debug, -vv for trace. `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the summary and write it as CSV
    Run {
        #[command(flatten)]
        settings: Settings,

        /// Also write the run manifest as JSON to this path
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Check the configuration and location pattern without touching the network
    Validate {
        #[command(flatten)]
        settings: Settings,
    },
}

/// Config file plus per-flag overrides.
#[derive(Args, Debug, Default, Clone)]
struct Settings {
    /// YAML config file (overrides TXSUM_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source location, e.g. s3://bucket/prefix/**/*.parquet
    #[arg(long)]
    source: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Memory budget for aggregation state, in bytes
    #[arg(long)]
    memory_budget: Option<usize>,

    #[arg(long)]
    spill_dir: Option<String>,

    /// none, zstd or lz4
    #[arg(long)]
    spill_codec: Option<String>,

    /// abort or skip
    #[arg(long)]
    timestamp_policy: Option<TimestampPolicy>,

    /// chrono format for string datetimes
    #[arg(long)]
    timestamp_format: Option<String>,

    #[arg(long)]
    amount_scale: Option<u32>,

    /// Output CSV path
    #[arg(short, long)]
    output: Option<String>,

    #[arg(long)]
    fetch_concurrency: Option<usize>,

    #[arg(long)]
    prefetch_depth: Option<usize>,

    #[arg(long)]
    fetch_timeout_ms: Option<u64>,

    #[arg(long)]
    retry_max: Option<usize>,

    #[arg(long)]
    aws_region: Option<String>,
}

impl Settings {
    fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(v) = &self.source {
            cfg.source_location = v.clone();
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.memory_budget {
            cfg.memory_budget_bytes = v;
        }
        if let Some(v) = &self.spill_dir {
            cfg.spill_dir = v.clone();
        }
        if let Some(v) = &self.spill_codec {
            cfg.spill_codec = v.clone();
        }
        if let Some(v) = self.timestamp_policy {
            cfg.timestamp_policy = v;
        }
        if let Some(v) = &self.timestamp_format {
            cfg.timestamp_format = v.clone();
        }
        if let Some(v) = self.amount_scale {
            cfg.amount_scale = v;
        }
        if let Some(v) = &self.output {
            cfg.output_path = v.clone();
        }
        if let Some(v) = self.fetch_concurrency {
            cfg.fetch_concurrency = v;
        }
        if let Some(v) = self.prefetch_depth {
            cfg.prefetch_depth = v;
        }
        if let Some(v) = self.fetch_timeout_ms {
            cfg.fetch_timeout_ms = v;
        }
        if let Some(v) = self.retry_max {
            cfg.retry_max_retries = v;
        }
        if let Some(v) = &self.aws_region {
            cfg.aws_region = Some(v.clone());
        }
    }

    /// defaults < environment < YAML file < flags
    fn resolve(&self) -> Result<PipelineConfig> {
        let yaml = match &self.config {
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?,
            ),
            None => None,
        };
        self.layer(PipelineConfig::from_env(), yaml.as_deref())
    }

    fn layer(&self, base: PipelineConfig, yaml: Option<&str>) -> Result<PipelineConfig> {
        let mut cfg = match yaml {
            Some(doc) => overlay_yaml(base, doc)?,
            None => base,
        };
        self.apply(&mut cfg);
        Ok(cfg)
    }
}

/// Overlay only the keys present in `doc`; absent keys keep the lower layer's value.
fn overlay_yaml(base: PipelineConfig, doc: &str) -> Result<PipelineConfig> {
    let mut merged = serde_yaml::to_value(&base).context("encoding base config")?;
    let overlay: serde_yaml::Value = serde_yaml::from_str(doc).context("parsing YAML config")?;
    let Some(target) = merged.as_mapping_mut() else {
        bail!("base config did not encode as a mapping");
    };
    match overlay {
        serde_yaml::Value::Null => {}
        serde_yaml::Value::Mapping(entries) => {
            for (key, value) in entries {
                if !target.contains_key(&key) {
                    bail!("unknown config key {}", serde_yaml::to_string(&key)?.trim());
                }
                target.insert(key, value);
            }
        }
        _ => bail!("config file must be a YAML mapping"),
    }
    serde_yaml::from_value(merged).context("invalid value in YAML config")
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .init();
}

/// SIGINT/SIGTERM cancel the run; a second signal exits immediately.
fn install_signal_handlers(cancel: CancelToken) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("txsum-signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                if cancel.is_cancelled() {
                    std::process::exit(128 + sig);
                }
                tracing::warn!(signal = sig, "cancelling run; send again to exit immediately");
                cancel.cancel();
            }
        })?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(verbose = cli.verbose, "txsum started");

    let result = match cli.command {
        Commands::Run { settings, manifest } => run(&settings, manifest.as_deref()),
        Commands::Validate { settings } => validate(&settings),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(run_err) = e.downcast_ref::<RunError>() {
                report(run_err);
                if run_err.is_cancelled() {
                    return ExitCode::from(130);
                }
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(settings: &Settings, manifest_path: Option<&Path>) -> Result<()> {
    let cfg = settings.resolve()?;
    let engine = Engine::new(cfg);
    install_signal_handlers(engine.cancel_token())?;

    let source = engine.config().source_location.clone();
    let started = Instant::now();
    println!("Source: {source}");
    println!("Start time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));

    let manifest = engine.run()?;

    let elapsed = started.elapsed();
    println!("End time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("Total duration: {elapsed:?}");
    println!("Total seconds: {:.3}", elapsed.as_secs_f64());
    println!(
        "Output: {} ({} rows)",
        manifest.output_path, manifest.metrics.output_rows
    );
    if let Some(digest) = manifest.outputs_digest {
        println!("Output digest: {digest}");
    }
    if manifest.metrics.spills > 0 {
        println!(
            "Spilled {} times (peak state {} bytes)",
            manifest.metrics.spills, manifest.metrics.peak_state_bytes
        );
    }

    if let Some(path) = manifest_path {
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(path, json).with_context(|| format!("writing manifest {}", path.display()))?;
    }
    Ok(())
}

fn validate(settings: &Settings) -> Result<()> {
    let cfg = settings.resolve()?;
    cfg.validate()?;
    let location = Location::parse(&cfg.source_location)?;
    Codec::from_str(&cfg.spill_codec)?;
    spill_storage_for(&cfg.spill_dir)?;

    println!("✓ Configuration is valid");
    println!("  Source: {} ({})", location, location.scheme().as_str());
    println!("  Pattern: {}", location.pattern());
    println!("  Output: {}", cfg.output_path);
    println!(
        "  Memory budget: {} bytes, spill dir {} ({})",
        cfg.memory_budget_bytes, cfg.spill_dir, cfg.spill_codec
    );
    Ok(())
}

fn report(err: &RunError) {
    eprintln!("Error in {} stage: {}", err.stage, err.error);
    if let Some(tip) = tip_for(err) {
        eprintln!("Tip: {tip}");
    }
}

fn tip_for(err: &RunError) -> Option<&'static str> {
    match (&err.stage, &err.error) {
        (_, Error::SourceUnavailable { kind, .. }) => Some(match kind {
            SourceFailure::AccessDenied => {
                "check AWS credentials (AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY or AWS_PROFILE) \
                 and that they can list and read the bucket"
            }
            SourceFailure::NotFound => {
                "check the bucket name, prefix and glob; a wrong region (--aws-region or \
                 AWS_REGION) can also hide a bucket"
            }
            SourceFailure::Network => "check connectivity to the store, or raise --retry-max",
            SourceFailure::Timeout => "raise --fetch-timeout-ms or lower --fetch-concurrency",
        }),
        (_, Error::InvalidTimestamp { .. }) => Some(
            "set --timestamp-format to the format of the datetime column, \
             or --timestamp-policy skip to drop such rows",
        ),
        (_, Error::SchemaMismatch { message, .. }) if message.contains("amount scale") => {
            Some("raise --amount-scale to at least the decimal scale of order_amount")
        }
        (_, Error::SchemaMismatch { .. }) => Some(
            "every partition needs transaction_id, customer_id, order_amount, order_qty and datetime",
        ),
        (Stage::Spill, _) | (_, Error::SpillWriteFailed(_)) => {
            Some("check free space and permissions in --spill-dir")
        }
        (_, Error::OutputWriteFailed(_)) => Some("check that the output directory is writable"),
        (Stage::Config, _) => Some("run `txsum validate` with the same flags for details"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_yaml_which_overrides_the_base() {
        let base = PipelineConfig {
            batch_size: 1_000,
            spill_dir: "/from/env".into(),
            ..PipelineConfig::default()
        };
        let yaml = "batch_size: 50\nspill_dir: /from/yaml\ntimestamp_policy: skip\n";
        let settings = Settings {
            spill_dir: Some("/from/flag".into()),
            ..Settings::default()
        };
        let cfg = settings.layer(base, Some(yaml)).unwrap();
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.spill_dir, "/from/flag");
        assert_eq!(cfg.timestamp_policy, TimestampPolicy::Skip);
        assert_eq!(cfg.output_path, "daily_transactions_summary.csv");
    }

    #[test]
    fn yaml_keeps_lower_layers_for_absent_keys() {
        let base = PipelineConfig {
            aws_region: Some("eu-west-1".into()),
            ..PipelineConfig::default()
        };
        let cfg = Settings::default()
            .layer(base, Some("amount_scale: 2\n"))
            .unwrap();
        assert_eq!(cfg.amount_scale, 2);
        assert_eq!(cfg.aws_region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let err = Settings::default()
            .layer(PipelineConfig::default(), Some("batchsize: 10\n"))
            .unwrap_err();
        assert!(err.to_string().contains("unknown config key batchsize"));
    }

    #[test]
    fn empty_yaml_is_a_no_op() {
        let cfg = Settings::default()
            .layer(PipelineConfig::default(), Some(""))
            .unwrap();
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "txsum",
            "-vv",
            "run",
            "--source",
            "file:///data/**/*.parquet",
            "--timestamp-policy",
            "skip",
            "--memory-budget",
            "1048576",
            "-o",
            "out.csv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Run { settings, manifest } = cli.command else {
            panic!("expected run");
        };
        assert!(manifest.is_none());
        let cfg = settings.layer(PipelineConfig::default(), None).unwrap();
        assert_eq!(cfg.source_location, "file:///data/**/*.parquet");
        assert_eq!(cfg.timestamp_policy, TimestampPolicy::Skip);
        assert_eq!(cfg.memory_budget_bytes, 1_048_576);
        assert_eq!(cfg.output_path, "out.csv");
    }

    #[test]
    fn bad_policy_flag_is_a_usage_error() {
        assert!(Cli::try_parse_from(["txsum", "run", "--timestamp-policy", "maybe"]).is_err());
    }

    #[test]
    fn tips_follow_the_failure_kind() {
        let denied = RunError::new(
            Stage::Source,
            Error::source_unavailable(SourceFailure::AccessDenied, "s3://b/p", "403"),
        );
        assert!(tip_for(&denied).unwrap().contains("credentials"));

        let scale = RunError::new(
            Stage::Aggregate,
            Error::schema_mismatch("p", "order_amount: decimal scale 8 exceeds amount scale 6"),
        );
        assert!(tip_for(&scale).unwrap().contains("--amount-scale"));

        let ts = RunError::new(
            Stage::Project,
            Error::InvalidTimestamp {
                raw: "x".into(),
                batch: txsum_core::id::BatchId::new(0),
                partition: "p".into(),
            },
        );
        assert!(tip_for(&ts).unwrap().contains("--timestamp-format"));

        assert!(tip_for(&RunError::new(Stage::Aggregate, Error::Cancelled)).is_none());
    }
}
