//! In-memory storage backend for tests.
//!
//! Used for `memory://` spill directories so a whole run stays in process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use txsum_mem::error::{Error as MemError, Result as MemResult};
use txsum_mem::Storage;

/// Thread-safe map of path to bytes. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> MemResult<()> {
        self.files().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> MemResult<Vec<u8>> {
        let files = self.files();
        let bytes = files
            .get(path)
            .ok_or_else(|| MemError::Storage(format!("path not found: {path}")))?;
        let start = usize::try_from(offset)
            .map_err(|_| MemError::Storage(format!("offset {offset} out of range")))?;
        start
            .checked_add(len)
            .and_then(|end| bytes.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                MemError::Storage(format!(
                    "range {start}+{len} exceeds size {} of '{path}'",
                    bytes.len()
                ))
            })
    }

    fn delete(&self, path: &str) -> MemResult<()> {
        self.files().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> MemResult<Vec<String>> {
        Ok(self
            .files()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn size(&self, path: &str) -> MemResult<u64> {
        self.files()
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| MemError::Storage(format!("path not found: {path}")))
    }

    fn remove_prefix(&self, prefix: &str) -> MemResult<()> {
        self.files().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}
