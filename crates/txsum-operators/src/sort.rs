//! Final ordering of the summary.
//!
//! The number of days is small, so the merged state is sorted in memory.

use std::cmp::Ordering;

use txsum_core::aggregate::{PartialAggregate, ResultRow, SummaryTable};

/// Amount descending; equal amounts fall back to the earlier date first.
pub fn summary_order(a: &ResultRow, b: &ResultRow) -> Ordering {
    b.total_order_amount
        .cmp(&a.total_order_amount)
        .then_with(|| a.date.cmp(&b.date))
}

/// Turn fully merged state into the ordered output table.
pub fn finalize(state: PartialAggregate, amount_scale: u32) -> SummaryTable {
    let mut rows: Vec<ResultRow> = state
        .iter()
        .map(|(key, st)| ResultRow::from_state(*key, st))
        .collect();
    rows.sort_unstable_by(summary_order);
    tracing::debug!(rows = rows.len(), "summary finalized");
    SummaryTable { amount_scale, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txsum_core::aggregate::{AggregateState, BucketKey};

    fn state(amount: i128) -> AggregateState {
        AggregateState {
            transaction_count: 1,
            customer_count: 1,
            total_order_amount: amount,
            total_order_qty: 1,
        }
    }

    fn day(d: i64) -> BucketKey {
        BucketKey::from_epoch_days(d).unwrap()
    }

    #[test]
    fn amounts_descend_and_ties_keep_dates_ascending() {
        let agg: PartialAggregate = [
            (day(3), state(50)),
            (day(1), state(10)),
            (day(5), state(50)),
            (day(2), state(70)),
            (day(4), state(-5)),
        ]
        .into_iter()
        .collect();

        let table = finalize(agg, 0);
        let order: Vec<(i64, i128)> = table
            .rows
            .iter()
            .map(|r| (r.date.epoch_days(), r.total_order_amount))
            .collect();
        assert_eq!(order, vec![(2, 70), (3, 50), (5, 50), (1, 10), (4, -5)]);
        assert_eq!(table.amount_scale, 0);
    }

    #[test]
    fn empty_state_yields_no_rows() {
        assert!(finalize(PartialAggregate::new(), 6).rows.is_empty());
    }
}
