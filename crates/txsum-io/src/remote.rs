//! Object store construction, failure classification and retry.
//!
//! Every remote call goes through `with_retry`, which bounds each attempt by
//! the fetch timeout and retries transient failures with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use object_store::ObjectStore;
use parquet::errors::ParquetError;
use txsum_core::config::SourceConfig;
use txsum_core::error::{Error, SourceFailure};

use crate::location::{Location, Scheme};

/// Retry/backoff settings for remote calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &SourceConfig) -> Self {
        Self {
            max_retries: cfg.retry_max_retries,
            initial_backoff: cfg.retry_initial_backoff,
            max_backoff: cfg.retry_max_backoff,
            timeout: cfg.fetch_timeout,
        }
    }

    pub fn next_backoff(&self, current: Duration) -> Duration {
        std::cmp::min(current.saturating_mul(2), self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// A failed remote step, before the location is attached.
#[derive(Debug)]
pub enum FetchError {
    Remote { kind: SourceFailure, message: String },
    /// Not worth retrying; already in the pipeline taxonomy.
    Fatal(Error),
}

const ACCESS_DENIED_MARKERS: &[&str] = &[
    "403",
    "401",
    "forbidden",
    "accessdenied",
    "access denied",
    "permission denied",
    "unauthorized",
    "unauthenticated",
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
    "expiredtoken",
    "no credentials",
];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline"];

/// Classify a failure message into a source failure kind.
pub fn classify_message(message: &str) -> SourceFailure {
    let lower = message.to_ascii_lowercase();
    if ACCESS_DENIED_MARKERS.iter().any(|m| lower.contains(m)) {
        SourceFailure::AccessDenied
    } else if TIMEOUT_MARKERS.iter().any(|m| lower.contains(m)) {
        SourceFailure::Timeout
    } else if lower.contains("404") || lower.contains("nosuchkey") || lower.contains("nosuchbucket")
    {
        SourceFailure::NotFound
    } else {
        SourceFailure::Network
    }
}

impl FetchError {
    pub fn timed_out(what: &str, after: Duration) -> Self {
        FetchError::Remote {
            kind: SourceFailure::Timeout,
            message: format!("{what} timed out after {after:?}"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Remote { kind, .. } => kind.is_retryable(),
            FetchError::Fatal(_) => false,
        }
    }

    /// Decode errors are fatal for the partition; storage errors underneath
    /// the reader are classified like any other remote failure.
    pub fn from_parquet(err: ParquetError, partition: &str) -> Self {
        if let ParquetError::External(inner) = &err {
            if let Some(store_err) = inner.downcast_ref::<object_store::Error>() {
                return FetchError::from_store(store_err);
            }
            return FetchError::Remote {
                kind: classify_message(&inner.to_string()),
                message: inner.to_string(),
            };
        }
        FetchError::Fatal(Error::schema_mismatch(
            partition,
            format!("cannot decode parquet: {err}"),
        ))
    }

    pub fn from_store(err: &object_store::Error) -> Self {
        use object_store::Error as StoreError;
        match err {
            StoreError::NotFound { .. } => FetchError::Remote {
                kind: SourceFailure::NotFound,
                message: err.to_string(),
            },
            StoreError::InvalidPath { .. }
            | StoreError::NotSupported { .. }
            | StoreError::NotImplemented
            | StoreError::UnknownConfigurationKey { .. } => {
                FetchError::Fatal(Error::Config(err.to_string()))
            }
            _ => FetchError::Remote {
                kind: classify_message(&err.to_string()),
                message: err.to_string(),
            },
        }
    }

    pub fn into_error(self, location: &str) -> Error {
        match self {
            FetchError::Remote { kind, message } => {
                Error::source_unavailable(kind, location, message)
            }
            FetchError::Fatal(e) => e,
        }
    }
}

impl From<object_store::Error> for FetchError {
    fn from(err: object_store::Error) -> Self {
        FetchError::from_store(&err)
    }
}

/// Run `op` with a per-attempt timeout, retrying transient failures.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0usize;
    let mut backoff = policy.initial_backoff;
    loop {
        let err = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => FetchError::timed_out(what, policy.timeout),
        };
        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }
        attempt += 1;
        tracing::warn!(
            operation = what,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = ?err,
            "transient source failure; retrying"
        );
        tokio::time::sleep(backoff).await;
        backoff = policy.next_backoff(backoff);
    }
}

fn missing_feature(scheme: &str, feature: &str) -> Error {
    Error::Config(format!(
        "txsum was built without the `{feature}` feature; rebuild with `--features {feature}` to read {scheme}:// locations"
    ))
}

/// Build the object store that serves `location`.
///
/// Credentials come from the environment (`AWS_*`, `GOOGLE_*`, `AZURE_*`),
/// the way the `object_store` builders resolve them.
pub fn build_store(location: &Location, cfg: &SourceConfig) -> Result<Arc<dyn ObjectStore>, Error> {
    let unavailable =
        |e: object_store::Error| FetchError::from_store(&e).into_error(&location.to_string());

    match location.scheme() {
        Scheme::S3 => {
            #[cfg(feature = "s3")]
            {
                let mut builder = object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(location.bucket())
                    .with_retry(store_retry(cfg));
                if let Some(region) = &cfg.aws_region {
                    builder = builder.with_region(region.clone());
                }
                Ok(Arc::new(builder.build().map_err(unavailable)?))
            }
            #[cfg(not(feature = "s3"))]
            {
                let _ = (cfg, unavailable);
                Err(missing_feature("s3", "s3"))
            }
        }
        Scheme::Gcs => {
            #[cfg(feature = "gcs")]
            {
                let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(location.bucket())
                    .with_retry(store_retry(cfg))
                    .build()
                    .map_err(unavailable)?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "gcs"))]
            {
                let _ = (cfg, unavailable);
                Err(missing_feature("gs", "gcs"))
            }
        }
        Scheme::Azure => {
            #[cfg(feature = "azure")]
            {
                let store = object_store::azure::MicrosoftAzureBuilder::from_env()
                    .with_container_name(location.bucket())
                    .with_retry(store_retry(cfg))
                    .build()
                    .map_err(unavailable)?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "azure"))]
            {
                let _ = (cfg, unavailable);
                Err(missing_feature("az", "azure"))
            }
        }
        Scheme::File => {
            let root = location
                .root_dir()
                .ok_or_else(|| Error::Invariant("local location without a root".into()))?;
            if !root.is_dir() {
                return Err(Error::source_unavailable(
                    SourceFailure::NotFound,
                    location.to_string(),
                    format!("directory '{}' does not exist", root.display()),
                ));
            }
            let store = object_store::local::LocalFileSystem::new_with_prefix(root)
                .map_err(unavailable)?;
            Ok(Arc::new(store))
        }
        // An empty in-process store would list nothing; callers that hold
        // one pass it to `PartitionedSource::with_store`.
        Scheme::Memory => Err(Error::Config(format!(
            "'{location}' has no backing store; pass one to PartitionedSource::with_store"
        ))),
    }
}

/// Retries happen in `with_retry`; the client itself fails fast.
#[cfg(any(feature = "s3", feature = "gcs", feature = "azure"))]
fn store_retry(cfg: &SourceConfig) -> object_store::RetryConfig {
    object_store::RetryConfig {
        max_retries: 0,
        retry_timeout: cfg.fetch_timeout,
        backoff: object_store::BackoffConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn messages_map_to_failure_kinds() {
        assert_eq!(
            classify_message("Client error with status 403 Forbidden: AccessDenied"),
            SourceFailure::AccessDenied
        );
        assert_eq!(
            classify_message("error sending request: operation timed out"),
            SourceFailure::Timeout
        );
        assert_eq!(classify_message("NoSuchBucket"), SourceFailure::NotFound);
        assert_eq!(classify_message("connection reset by peer"), SourceFailure::Network);
    }

    #[test]
    fn store_not_found_is_not_retryable() {
        let err = object_store::Error::NotFound {
            path: "a/b.parquet".into(),
            source: "missing".into(),
        };
        let fetch = FetchError::from(err);
        assert!(!fetch.is_retryable());
        assert!(matches!(
            fetch.into_error("s3://b/a"),
            Error::SourceUnavailable {
                kind: SourceFailure::NotFound,
                ..
            }
        ));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let p = quick_policy(3);
        assert_eq!(p.next_backoff(Duration::from_millis(1)), Duration::from_millis(2));
        assert_eq!(p.next_backoff(Duration::from_millis(3)), Duration::from_millis(4));
    }

    #[test]
    fn retries_network_failures_then_succeeds() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let calls = AtomicUsize::new(0);
        let result = rt.block_on(with_retry(&quick_policy(3), "get", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(FetchError::Remote {
                        kind: SourceFailure::Network,
                        message: "connection reset".into(),
                    })
                } else {
                    Ok(n)
                }
            }
        }));
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = rt.block_on(with_retry(&quick_policy(2), "get", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(FetchError::Remote {
                    kind: SourceFailure::Timeout,
                    message: "slow".into(),
                })
            }
        }));
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn attempts_are_bounded_by_the_timeout() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let result: Result<(), _> = rt.block_on(with_retry(&quick_policy(0), "list", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }));
        assert!(matches!(
            result,
            Err(FetchError::Remote {
                kind: SourceFailure::Timeout,
                ..
            })
        ));
    }

    #[test]
    fn memory_locations_need_an_explicit_store() {
        let cfg = txsum_core::config::PipelineConfig {
            source_location: "memory://tx/*.parquet".into(),
            ..Default::default()
        }
        .source_config();
        let location = Location::parse(&cfg.location).unwrap();
        match build_store(&location, &cfg) {
            Err(Error::Config(msg)) => assert!(msg.contains("with_store"), "{msg}"),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("memory:// built a store"),
        }
    }
}
