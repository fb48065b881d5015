//! Spill manager for aggregate state.
//!
//! Writes a `PartialAggregate` as one checksummed segment, and later folds
//! every segment back into a single table. Segment IO runs on a helper
//! thread so a hung filesystem surfaces as `Error::Timeout` instead of a
//! stalled run.

pub mod codec;
pub mod segment;

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use txsum_core::aggregate::{AggregateState, BucketKey, PartialAggregate};
use txsum_core::cancel::CancelToken;
use txsum_core::id::SpillId;

use crate::error::{Error, Result};

pub use codec::Codec;
pub use segment::{SegmentHandle, SegmentHeader, HEADER_LEN, MAGIC};

/// Abstract storage interface for spill segments.
///
/// Implemented by `txsum-io::FsStorage` for the local filesystem and by
/// `txsum-io::MemoryStorage` for tests.
pub trait Storage: Send + Sync + 'static {
    /// Write bytes to a path atomically: readers see either nothing or the
    /// complete file. The parent directory must already exist.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Create a directory and its parents. Stores without directories
    /// ignore it.
    fn create_dir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Read a byte range from a path. Returns exactly `len` bytes or error.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Delete a path. Idempotent.
    fn delete(&self, path: &str) -> Result<()>;

    /// List all paths under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of a path in bytes.
    fn size(&self, path: &str) -> Result<u64>;

    /// Remove a prefix and everything under it. Idempotent.
    fn remove_prefix(&self, prefix: &str) -> Result<()>;
}

/// Owns the spill directory of one run.
pub struct SpillManager {
    storage: Arc<dyn Storage>,
    codec: Codec,
    root_dir: String,
    timeout: Duration,
    next_id: SpillId,
    bytes_written: u64,
    dir_created: bool,
    /// Helper threads that outlived their deadline.
    stragglers: Mutex<Vec<JoinHandle<()>>>,
}

impl SpillManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        codec: Codec,
        root_dir: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            codec,
            root_dir: root_dir.into(),
            timeout,
            next_id: SpillId::new(0),
            bytes_written: 0,
            dir_created: false,
            stragglers: Mutex::new(Vec::new()),
        }
    }

    /// Run `op` on a helper thread and wait at most `self.timeout` for it.
    ///
    /// A thread that misses the deadline is kept so `cleanup` can wait for
    /// it before removing the spill directory.
    fn with_deadline<T, F>(&self, what: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name(format!("txsum-spill-{what}"))
            .spawn(move || {
                let _ = tx.send(op());
            })
            .map_err(|e| Error::Storage(format!("spawn spill {what} thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => {
                let _ = handle.join();
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                self.stragglers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
                Err(Error::Timeout {
                    what,
                    after: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(Error::Storage(format!("spill {what} thread exited without a result")))
            }
        }
    }

    pub fn root_dir(&self) -> &str {
        &self.root_dir
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Number of segments written so far.
    pub fn segments_written(&self) -> u64 {
        self.next_id.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Persist `state` as one immutable segment.
    ///
    /// The segment is written to completion before this returns; a failed or
    /// timed-out write leaves no visible segment behind.
    pub fn persist(&mut self, state: &PartialAggregate) -> Result<SegmentHandle> {
        let entries = state.to_sorted_vec();
        let key_range = match (entries.first(), entries.last()) {
            (Some((lo, _)), Some((hi, _))) => Some((*lo, *hi)),
            _ => None,
        };

        let payload = serde_json::to_vec(&entries)
            .map_err(|e| Error::Codec(format!("json serialize: {e}")))?;
        let uncompressed_len = payload.len() as u64;
        let compressed = self.codec.compress(&payload)?;

        let header = SegmentHeader {
            codec: self.codec,
            entry_count: entries.len() as u64,
            uncompressed_len,
            compressed_len: compressed.len() as u64,
        };
        let header_bytes = header.to_bytes();

        let mut segment = Vec::with_capacity(HEADER_LEN + compressed.len());
        segment.extend_from_slice(&header_bytes);
        segment.extend_from_slice(&compressed);
        let checksum: [u8; 32] = blake3::hash(&segment).into();

        if !self.dir_created {
            self.storage.create_dir(&self.root_dir)?;
            self.dir_created = true;
        }

        let id = self.next_id;
        let path = format!("{}/segment-{:06}.seg", self.root_dir, id.get());

        let storage = Arc::clone(&self.storage);
        let target = path.clone();
        let len = segment.len() as u64;
        self.with_deadline("write", move || storage.write(&target, &segment))?;

        self.next_id = id.next();
        self.bytes_written += len;

        tracing::debug!(
            segment = %id,
            path = %path,
            entries = header.entry_count,
            bytes = len,
            codec = %self.codec,
            "spilled aggregate state"
        );

        Ok(SegmentHandle {
            id,
            path,
            codec: self.codec,
            entry_count: header.entry_count,
            uncompressed_len,
            compressed_len: header.compressed_len,
            checksum,
            key_range,
        })
    }

    /// Read and verify one segment.
    pub fn read_segment(&self, handle: &SegmentHandle) -> Result<Vec<(BucketKey, AggregateState)>> {
        let storage = Arc::clone(&self.storage);
        let path = handle.path.clone();
        let total = handle.total_len() as usize;
        let bytes = self.with_deadline("read", move || {
            storage.read_range(&path, 0, total)
        })?;

        let computed: [u8; 32] = blake3::hash(&bytes).into();
        if computed != handle.checksum {
            return Err(Error::ChecksumMismatch {
                path: handle.path.clone(),
            });
        }

        let header = SegmentHeader::from_bytes(&bytes)?;
        if header.compressed_len != handle.compressed_len {
            return Err(Error::Corrupt(format!(
                "'{}' payload length {} does not match handle {}",
                handle.path, header.compressed_len, handle.compressed_len
            )));
        }
        let payload = header
            .codec
            .decompress(&bytes[HEADER_LEN..], header.uncompressed_len as usize)?;

        let entries: Vec<(BucketKey, AggregateState)> = serde_json::from_slice(&payload)
            .map_err(|e| Error::Codec(format!("json deserialize: {e}")))?;
        if entries.len() as u64 != header.entry_count {
            return Err(Error::Corrupt(format!(
                "'{}' holds {} entries, header says {}",
                handle.path,
                entries.len(),
                header.entry_count
            )));
        }
        Ok(entries)
    }

    /// Fold every segment plus the residual in-memory state into one table.
    ///
    /// Segments are deleted only after all of them merged successfully.
    /// Failing to delete is logged and otherwise ignored.
    pub fn merge_all(
        &mut self,
        handles: Vec<SegmentHandle>,
        residual: PartialAggregate,
        cancel: &CancelToken,
    ) -> Result<PartialAggregate> {
        let mut merged = residual;
        for handle in &handles {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entries = self.read_segment(handle)?;
            tracing::trace!(segment = %handle.id, entries = entries.len(), "merging segment");
            for (key, state) in &entries {
                merged.merge_state(*key, state);
            }
        }

        for handle in &handles {
            if let Err(e) = self.storage.delete(&handle.path) {
                tracing::warn!(path = %handle.path, error = %e, "failed to delete merged segment");
            }
        }

        tracing::debug!(
            segments = handles.len(),
            buckets = merged.len(),
            "merged spilled state"
        );
        Ok(merged)
    }

    /// Remove the run's spill directory. Logged, never fatal.
    ///
    /// Timed-out helper threads get one more spill timeout to finish first,
    /// so a late write cannot land after the directory is gone. Writes that
    /// are still running then fail, since their directory no longer exists.
    pub fn cleanup(&self) {
        let stragglers =
            std::mem::take(&mut *self.stragglers.lock().unwrap_or_else(PoisonError::into_inner));
        if !stragglers.is_empty() {
            let deadline = Instant::now() + self.timeout;
            while stragglers.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            let running = stragglers.iter().filter(|h| !h.is_finished()).count();
            if running > 0 {
                tracing::warn!(running, dir = %self.root_dir, "spill threads still running at cleanup");
            }
        }

        if let Err(e) = self.storage.remove_prefix(&self.root_dir) {
            tracing::warn!(dir = %self.root_dir, error = %e, "failed to remove spill directory");
        }
    }
}
