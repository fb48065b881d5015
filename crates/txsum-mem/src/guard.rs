//! MemoryBudget + RAII guard implementations.
//!
//! The aggregation engine holds one guard for its resident state and resizes
//! it after every batch. A refused resize is the memory-pressure signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use txsum_core::budget::{BudgetGuard, MemoryBudget};

/// Shared inner state for the budget.
struct BudgetInner {
    capacity: usize,
    used: AtomicUsize,
}

impl BudgetInner {
    fn charge(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            match self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Concrete MemoryBudget implementation used by the pipeline.
#[derive(Clone)]
pub struct MemoryBudgetImpl {
    inner: Arc<BudgetInner>,
}

impl MemoryBudgetImpl {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                capacity: capacity_bytes,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Bytes still available (advisory).
    pub fn headroom(&self) -> usize {
        self.inner
            .capacity
            .saturating_sub(self.inner.used.load(Ordering::Relaxed))
    }

    fn guard(&self, bytes: usize, tag: &'static str) -> BudgetGuardImpl {
        BudgetGuardImpl {
            inner: Arc::clone(&self.inner),
            bytes,
            tag,
        }
    }
}

/// RAII charge against the budget. Dropping it returns the bytes.
pub struct BudgetGuardImpl {
    inner: Arc<BudgetInner>,
    bytes: usize,
    tag: &'static str,
}

impl Drop for BudgetGuardImpl {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.inner.release(self.bytes);
            self.bytes = 0;
        }
    }
}

impl BudgetGuard for BudgetGuardImpl {
    fn bytes(&self) -> usize {
        self.bytes
    }
    fn tag(&self) -> &'static str {
        self.tag
    }
}

impl BudgetGuardImpl {
    /// Resize the charge to `new_bytes`.
    ///
    /// Shrinking always succeeds. Growing succeeds only if the extra bytes
    /// fit; on failure the guard keeps its previous size.
    pub fn try_resize(&mut self, new_bytes: usize) -> bool {
        if new_bytes <= self.bytes {
            self.inner.release(self.bytes - new_bytes);
            self.bytes = new_bytes;
            return true;
        }
        let delta = new_bytes - self.bytes;
        if self.inner.charge(delta) {
            self.bytes = new_bytes;
            true
        } else {
            tracing::trace!(
                tag = self.tag,
                held = self.bytes,
                requested = new_bytes,
                "budget refused resize"
            );
            false
        }
    }
}

impl MemoryBudget for MemoryBudgetImpl {
    type Guard = BudgetGuardImpl;

    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard> {
        if bytes == 0 || self.inner.charge(bytes) {
            Some(self.guard(bytes, tag))
        } else {
            None
        }
    }

    fn capacity_bytes(&self) -> usize {
        self.inner.capacity
    }

    fn used_bytes(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }
}
