//! Peak tracking for resident aggregation state.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct PeakTracker {
    peak_bytes: AtomicUsize,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new "resident bytes" value; updates peak if higher.
    pub fn record(&self, used_bytes: usize) {
        let prev = self.peak_bytes.fetch_max(used_bytes, Ordering::AcqRel);
        if used_bytes > prev {
            tracing::trace!(used_bytes, "new resident state peak");
        }
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::PeakTracker;

    #[test]
    fn keeps_the_maximum() {
        let t = PeakTracker::new();
        t.record(10);
        t.record(40);
        t.record(5);
        assert_eq!(t.peak(), 40);
    }
}
