//! Coarse memory model for resident aggregation state.
//!
//! Exact heap accounting is not attempted; the estimate only has to grow
//! with the state so the budget can push back.

use serde::{Deserialize, Serialize};

/// Estimated bytes per resident bucket: key, four accumulators and the
/// hash-table slot around them.
pub const ENTRY_FOOTPRINT_BYTES: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    /// Estimated bytes per resident entry.
    pub bytes_per_entry: usize,
    /// Fixed overhead charged once the table holds anything.
    pub overhead_bytes: usize,
}

impl Default for Footprint {
    fn default() -> Self {
        Self {
            bytes_per_entry: ENTRY_FOOTPRINT_BYTES,
            overhead_bytes: 0,
        }
    }
}

impl Footprint {
    pub fn estimate(&self, entries: usize) -> usize {
        if entries == 0 {
            return 0;
        }
        self.overhead_bytes
            .saturating_add(self.bytes_per_entry.saturating_mul(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_costs_nothing() {
        let f = Footprint {
            bytes_per_entry: 10,
            overhead_bytes: 100,
        };
        assert_eq!(f.estimate(0), 0);
        assert_eq!(f.estimate(3), 130);
        assert_eq!(Footprint::default().estimate(2), 2 * ENTRY_FOOTPRINT_BYTES);
    }
}
