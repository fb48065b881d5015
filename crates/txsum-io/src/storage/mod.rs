//! Storage adapters implementing `txsum_mem::spill::Storage`.
//!
//! Spill segments always live on local disk; `memory://` is accepted so
//! tests can keep everything in process.

mod fs;
pub use fs::FsStorage;

use std::sync::Arc;

use txsum_mem::Storage;

use crate::error::{Error, Result};
use crate::memory_storage::MemoryStorage;

/// Pick the spill backend for a configured spill directory.
pub fn spill_storage_for(spill_dir: &str) -> Result<Arc<dyn Storage>> {
    match spill_dir.split_once("://") {
        None => Ok(Arc::new(FsStorage::new())),
        Some(("file", _)) => Ok(Arc::new(FsStorage::new())),
        Some(("memory", _)) => Ok(Arc::new(MemoryStorage::new())),
        Some((scheme, _)) => Err(Error::Config(format!(
            "spill directory must be local; '{scheme}://' is not supported"
        ))),
    }
}

/// Strip a `file://` prefix so the path can be handed to `FsStorage`.
pub fn local_spill_path(spill_dir: &str) -> &str {
    spill_dir.strip_prefix("file://").unwrap_or(spill_dir)
}
