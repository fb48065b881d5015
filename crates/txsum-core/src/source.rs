//! Pull interface between a batch source and the aggregation loop.

use crate::error::Result;
use crate::types::Batch;

/// A lazy, finite sequence of batches.
///
/// `Ok(None)` marks the end of the sequence. Sources are not restartable
/// mid-stream; re-open them to iterate again from the start.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

impl<S: BatchSource + ?Sized> BatchSource for Box<S> {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        (**self).next_batch()
    }
}

/// Source over batches already in memory; used by tests and benchmarks.
pub struct VecSource {
    batches: std::vec::IntoIter<Batch>,
}

impl VecSource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: batches.into_iter(),
        }
    }
}

impl BatchSource for VecSource {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        Ok(self.batches.next())
    }
}
