//! Abstract memory budget interfaces.
//!
//! The concrete implementation lives in `txsum-mem`. Only the traits live here
//! so the aggregation operators can charge their resident state against a
//! budget without depending on the spill machinery.

/// A charge held against a memory budget.
///
/// The concrete type lives in `txsum-mem`. It must be RAII (releases on Drop)
/// and `Send`.
pub trait BudgetGuard: Send {
    /// Number of bytes currently charged by this guard.
    fn bytes(&self) -> usize;
    /// Debug tag for tracing.
    fn tag(&self) -> &'static str {
        "guard"
    }
}

/// A handle representing a memory-cap enforcer.
///
/// When `try_acquire` returns `None` the caller is over budget and must spill
/// before accumulating more state.
pub trait MemoryBudget: Send + Sync + 'static {
    type Guard: BudgetGuard;

    /// Attempt to charge `bytes` to the budget. Returns a guard on success.
    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard>;

    /// Total configured capacity (bytes).
    fn capacity_bytes(&self) -> usize;

    /// Approximate currently charged bytes (advisory).
    fn used_bytes(&self) -> usize;
}

// NOTE: no default impls that would silently "allow" a charge; guards are
// only constructed by the mem crate.
