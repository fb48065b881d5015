//! `PartitionedSource`: the `BatchSource` over a partitioned Parquet dataset.
//!
//! Partitions are listed once, sorted by object key, and fetched by at most
//! `fetch_concurrency` tasks. Each task decodes its partition into a bounded
//! channel of `prefetch_depth` batches; the consumer drains the channels in
//! partition order, so the batch sequence is the same on every run no matter
//! which fetch finishes first.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use object_store::{ObjectMeta, ObjectStore};
use parquet::arrow::async_reader::{ParquetObjectReader, ParquetRecordBatchStreamBuilder};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use txsum_core::cancel::CancelToken;
use txsum_core::config::SourceConfig;
use txsum_core::error::{Error, Result, SourceFailure};
use txsum_core::hash::{Hash256, StreamHasher};
use txsum_core::id::BatchId;
use txsum_core::source::BatchSource;
use txsum_core::types::{Batch, RowBatch};

use crate::location::Location;
use crate::readers::parquet::{projection, record_batch_to_rows};
use crate::remote::{build_store, with_retry, FetchError, RetryPolicy};

/// One object in the partition inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub uri: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// Counters for what the source has produced so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub partitions_completed: u64,
    pub batches: u64,
    pub rows: u64,
}

struct FetchContext {
    batch_size: usize,
    prefetch_depth: usize,
    policy: RetryPolicy,
}

struct InFlight {
    partition: Arc<str>,
    rx: mpsc::Receiver<Result<RowBatch>>,
    task: JoinHandle<()>,
}

pub struct PartitionedSource {
    runtime: Runtime,
    store: Arc<dyn ObjectStore>,
    location: Location,
    ctx: Arc<FetchContext>,
    fetch_concurrency: usize,
    partitions: Vec<(ObjectMeta, PartitionInfo)>,
    next_partition: usize,
    in_flight: VecDeque<InFlight>,
    next_batch_id: BatchId,
    stats: SourceStats,
    cancel: CancelToken,
}

fn fetch_runtime(workers: usize) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .thread_name("txsum-fetch")
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("cannot start fetch runtime: {e}")))
}

impl PartitionedSource {
    /// Parse the location, connect to its store and list the partitions.
    pub fn open(cfg: &SourceConfig, cancel: CancelToken) -> Result<Self> {
        let location = Location::parse(&cfg.location)?;
        let store = build_store(&location, cfg)?;
        Self::with_store(store, location, cfg, cancel)
    }

    /// Like `open`, against an already built store.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        location: Location,
        cfg: &SourceConfig,
        cancel: CancelToken,
    ) -> Result<Self> {
        if cfg.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".into()));
        }
        let runtime = fetch_runtime(cfg.fetch_concurrency)?;
        let ctx = Arc::new(FetchContext {
            batch_size: cfg.batch_size,
            prefetch_depth: cfg.prefetch_depth.max(1),
            policy: RetryPolicy::from_config(cfg),
        });

        let metas = runtime
            .block_on(list_partitions(&store, &location, &ctx.policy))
            .map_err(|e| e.into_error(&location.to_string()))?;
        if metas.is_empty() {
            return Err(Error::source_unavailable(
                SourceFailure::NotFound,
                location.to_string(),
                format!("no objects match '{}'", location.pattern()),
            ));
        }

        let partitions: Vec<(ObjectMeta, PartitionInfo)> = metas
            .into_iter()
            .map(|meta| {
                let info = PartitionInfo {
                    uri: location.uri_for(meta.location.as_ref()),
                    size: meta.size as u64,
                    etag: meta.e_tag.clone(),
                };
                (meta, info)
            })
            .collect();

        let total_bytes: u64 = partitions.iter().map(|(_, p)| p.size).sum();
        tracing::info!(
            location = %location,
            partitions = partitions.len(),
            total_bytes,
            "listed source partitions"
        );

        Ok(Self {
            runtime,
            store,
            location,
            ctx,
            fetch_concurrency: cfg.fetch_concurrency.max(1),
            partitions,
            next_partition: 0,
            in_flight: VecDeque::new(),
            next_batch_id: BatchId::new(0),
            stats: SourceStats::default(),
            cancel,
        })
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.partitions.iter().map(|(_, info)| info)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// BLAKE3 digest of the partition inventory (uri, size, etag per entry).
    pub fn inventory_digest(&self) -> Hash256 {
        let mut hasher = StreamHasher::new();
        for (_, info) in &self.partitions {
            hasher.update(info.uri.as_bytes());
            hasher.update(&info.size.to_le_bytes());
            hasher.update(info.etag.as_deref().unwrap_or("").as_bytes());
            hasher.update(b"\n");
        }
        hasher.finish()
    }

    /// Start over from the first partition. The listing is not refreshed.
    pub fn rewind(&mut self) {
        self.abort_in_flight();
        self.next_partition = 0;
        self.next_batch_id = BatchId::new(0);
        self.stats = SourceStats::default();
    }

    fn spawn_fetches(&mut self) {
        while self.in_flight.len() < self.fetch_concurrency
            && self.next_partition < self.partitions.len()
        {
            let (meta, info) = &self.partitions[self.next_partition];
            self.next_partition += 1;

            let partition: Arc<str> = Arc::from(info.uri.as_str());
            let (tx, rx) = mpsc::channel(self.ctx.prefetch_depth);
            tracing::debug!(partition = %partition, size = info.size, "fetching partition");
            let task = self.runtime.spawn(fetch_partition(
                Arc::clone(&self.store),
                meta.clone(),
                Arc::clone(&partition),
                Arc::clone(&self.ctx),
                tx,
            ));
            self.in_flight.push_back(InFlight {
                partition,
                rx,
                task,
            });
        }
    }

    fn abort_in_flight(&mut self) {
        for fetch in self.in_flight.drain(..) {
            fetch.task.abort();
        }
    }
}

impl BatchSource for PartitionedSource {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        loop {
            if let Err(e) = self.cancel.check() {
                self.abort_in_flight();
                return Err(e);
            }
            self.spawn_fetches();

            let Some(front) = self.in_flight.front_mut() else {
                return Ok(None);
            };
            match self.runtime.block_on(front.rx.recv()) {
                Some(Ok(rows)) => {
                    if rows.num_rows() == 0 {
                        continue;
                    }
                    let id = self.next_batch_id;
                    self.next_batch_id = id.next();
                    self.stats.batches += 1;
                    self.stats.rows += rows.num_rows() as u64;
                    return Ok(Some(Batch::new(id, Arc::clone(&front.partition), rows)));
                }
                Some(Err(e)) => {
                    self.abort_in_flight();
                    return Err(e);
                }
                None => {
                    if let Some(done) = self.in_flight.pop_front() {
                        self.stats.partitions_completed += 1;
                        tracing::debug!(partition = %done.partition, "partition exhausted");
                    }
                }
            }
        }
    }
}

impl Drop for PartitionedSource {
    fn drop(&mut self) {
        self.abort_in_flight();
    }
}

async fn list_partitions(
    store: &Arc<dyn ObjectStore>,
    location: &Location,
    policy: &RetryPolicy,
) -> std::result::Result<Vec<ObjectMeta>, FetchError> {
    let prefix = location.list_prefix();
    let prefix = prefix.as_ref();
    let mut metas = with_retry(policy, "list", || async move {
        let all: Vec<ObjectMeta> = store.list(prefix).try_collect().await?;
        Ok::<_, FetchError>(all)
    })
    .await?;
    metas.retain(|meta| location.matches(meta.location.as_ref()));
    metas.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));
    Ok(metas)
}

enum StreamEnd {
    /// The consumer went away; nothing left to do.
    Closed,
    Failed(FetchError),
}

impl From<FetchError> for StreamEnd {
    fn from(e: FetchError) -> Self {
        StreamEnd::Failed(e)
    }
}

/// Fetch one partition, retrying transient failures.
///
/// A retry reopens the object and skips the batches already delivered.
async fn fetch_partition(
    store: Arc<dyn ObjectStore>,
    meta: ObjectMeta,
    partition: Arc<str>,
    ctx: Arc<FetchContext>,
    tx: mpsc::Sender<Result<RowBatch>>,
) {
    let policy = &ctx.policy;
    let mut delivered = 0usize;
    let mut attempt = 0usize;
    let mut backoff = policy.initial_backoff;
    loop {
        let err = match stream_partition(&store, &meta, &partition, &ctx, &tx, &mut delivered).await
        {
            Ok(()) | Err(StreamEnd::Closed) => return,
            Err(StreamEnd::Failed(err)) => err,
        };
        if err.is_retryable() && attempt < policy.max_retries {
            attempt += 1;
            tracing::warn!(
                partition = %partition,
                attempt,
                delivered,
                error = ?err,
                "partition fetch failed; retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = policy.next_backoff(backoff);
            continue;
        }
        let _ = tx.send(Err(err.into_error(&partition))).await;
        return;
    }
}

async fn stream_partition(
    store: &Arc<dyn ObjectStore>,
    meta: &ObjectMeta,
    partition: &str,
    ctx: &FetchContext,
    tx: &mpsc::Sender<Result<RowBatch>>,
    delivered: &mut usize,
) -> std::result::Result<(), StreamEnd> {
    let timeout = ctx.policy.timeout;
    let reader = ParquetObjectReader::new(Arc::clone(store), meta.clone());
    let builder = tokio::time::timeout(timeout, ParquetRecordBatchStreamBuilder::new(reader))
        .await
        .map_err(|_| FetchError::timed_out("parquet footer fetch", timeout))?
        .map_err(|e| FetchError::from_parquet(e, partition))?;

    let mask = projection(builder.parquet_schema(), builder.schema())
        .map_err(|m| FetchError::Fatal(Error::schema_mismatch(partition, m)))?;
    let mut stream = builder
        .with_batch_size(ctx.batch_size)
        .with_projection(mask)
        .build()
        .map_err(|e| FetchError::from_parquet(e, partition))?;

    let mut index = 0usize;
    loop {
        let next = tokio::time::timeout(timeout, stream.next())
            .await
            .map_err(|_| FetchError::timed_out("row group fetch", timeout))?;
        let Some(decoded) = next else {
            return Ok(());
        };
        let decoded = decoded.map_err(|e| FetchError::from_parquet(e, partition))?;
        index += 1;
        if index <= *delivered {
            continue;
        }
        let rows = record_batch_to_rows(&decoded)
            .map_err(|m| FetchError::Fatal(Error::schema_mismatch(partition, m)))?;
        if tx.send(Ok(rows)).await.is_err() {
            return Err(StreamEnd::Closed);
        }
        *delivered = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arrow_array::{Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray};
    use arrow_schema::{DataType, Field, Schema, TimeUnit};
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::PutPayload;
    use parquet::arrow::ArrowWriter;
    use parquet::file::properties::WriterProperties;

    fn config(location: &str, batch_size: usize) -> SourceConfig {
        SourceConfig {
            location: location.to_string(),
            batch_size,
            fetch_concurrency: 2,
            prefetch_depth: 1,
            fetch_timeout: Duration::from_secs(10),
            retry_max_retries: 1,
            retry_initial_backoff: Duration::from_millis(1),
            retry_max_backoff: Duration::from_millis(2),
            aws_region: None,
        }
    }

    fn parquet_bytes(first_tx: i64, rows: usize, with_qty: bool) -> Bytes {
        let mut fields = vec![
            Field::new("transaction_id", DataType::Int64, true),
            Field::new("customer_id", DataType::Utf8, true),
            Field::new("order_amount", DataType::Int64, true),
            Field::new(
                "datetime",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
        ];
        let ids: Vec<i64> = (0..rows as i64).map(|i| first_tx + i).collect();
        let mut columns: Vec<arrow_array::ArrayRef> = vec![
            Arc::new(Int64Array::from(ids.clone())),
            Arc::new(StringArray::from(
                ids.iter().map(|i| format!("c{i}")).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(vec![10; rows])),
            Arc::new(TimestampMicrosecondArray::from(vec![
                1_704_067_200_000_000;
                rows
            ])),
        ];
        if with_qty {
            fields.push(Field::new("order_qty", DataType::Int64, true));
            columns.push(Arc::new(Int64Array::from(vec![1; rows])));
        }
        let schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(Arc::clone(&schema), columns).unwrap();

        let mut buf = Vec::new();
        let props = WriterProperties::builder()
            .set_max_row_group_size(4)
            .build();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(props)).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buf)
    }

    fn store_with(files: &[(&str, Bytes)]) -> Arc<dyn ObjectStore> {
        let store = Arc::new(InMemory::new());
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        for (key, bytes) in files {
            rt.block_on(store.put(&ObjectPath::from(*key), PutPayload::from(bytes.clone())))
                .unwrap();
        }
        store
    }

    fn open(store: Arc<dyn ObjectStore>, location: &str, batch_size: usize) -> Result<PartitionedSource> {
        let cfg = config(location, batch_size);
        PartitionedSource::with_store(
            store,
            Location::parse(location).unwrap(),
            &cfg,
            CancelToken::new(),
        )
    }

    fn drain(source: &mut PartitionedSource) -> Vec<Batch> {
        let mut out = Vec::new();
        while let Some(b) = source.next_batch().unwrap() {
            out.push(b);
        }
        out
    }

    #[test]
    fn batches_arrive_in_partition_key_order() {
        let store = store_with(&[
            ("tx/date=2024-01-02/part-0.parquet", parquet_bytes(100, 3, true)),
            ("tx/date=2024-01-01/part-0.parquet", parquet_bytes(0, 10, true)),
            ("tx/_SUCCESS", Bytes::from_static(b"")),
        ]);
        let mut source = open(store, "memory://tx/**/*.parquet", 4).unwrap();
        assert_eq!(source.partition_count(), 2);

        let batches = drain(&mut source);
        assert!(batches.iter().all(|b| b.num_rows() <= 4));
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 13);
        assert!(batches[0].partition.contains("2024-01-01"));
        assert!(batches.last().unwrap().partition.contains("2024-01-02"));
        let ids: Vec<u64> = batches.iter().map(|b| b.id.get()).collect();
        assert_eq!(ids, (0..batches.len() as u64).collect::<Vec<_>>());
        assert_eq!(source.stats().partitions_completed, 2);
    }

    #[test]
    fn rewind_replays_the_same_sequence() {
        let store = store_with(&[
            ("tx/a.parquet", parquet_bytes(0, 5, true)),
            ("tx/b.parquet", parquet_bytes(5, 5, true)),
        ]);
        let mut source = open(store, "memory://tx/*.parquet", 2).unwrap();
        let first: Vec<usize> = drain(&mut source).iter().map(|b| b.num_rows()).collect();
        let digest = source.inventory_digest();
        source.rewind();
        let second: Vec<usize> = drain(&mut source).iter().map(|b| b.num_rows()).collect();
        assert_eq!(first, second);
        assert_eq!(digest, source.inventory_digest());
    }

    #[test]
    fn empty_listing_is_not_found() {
        let store = store_with(&[("other/a.parquet", parquet_bytes(0, 1, true))]);
        match open(store, "memory://tx/**/*.parquet", 10) {
            Err(Error::SourceUnavailable { kind, .. }) => assert_eq!(kind, SourceFailure::NotFound),
            other => panic!("expected NotFound, got {:?}", other.err()),
        }
    }

    #[test]
    fn missing_column_is_a_schema_mismatch() {
        let store = store_with(&[("tx/a.parquet", parquet_bytes(0, 3, false))]);
        let mut source = open(store, "memory://tx/*.parquet", 10).unwrap();
        match source.next_batch() {
            Err(Error::SchemaMismatch { partition, message }) => {
                assert!(partition.ends_with("tx/a.parquet"));
                assert!(message.contains("order_qty"), "{message}");
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_stops_the_stream() {
        let store = store_with(&[("tx/a.parquet", parquet_bytes(0, 8, true))]);
        let cancel = CancelToken::new();
        let cfg = config("memory://tx/*.parquet", 2);
        let mut source = PartitionedSource::with_store(
            store,
            Location::parse(&cfg.location).unwrap(),
            &cfg,
            cancel.clone(),
        )
        .unwrap();
        assert!(source.next_batch().unwrap().is_some());
        cancel.cancel();
        assert!(matches!(source.next_batch(), Err(Error::Cancelled)));
    }
}
