//! Per-day aggregate state and its merge rule.
//!
//! Partial states for the same bucket key may live in memory and in any
//! number of spill segments at once. `AggregateState::merge` is plain
//! integer addition on every accumulator, so folding partials in any order
//! and any grouping yields the same totals.

use std::collections::HashMap;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::types::Scalar;

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;
const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Calendar date used to group rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketKey(NaiveDate);

impl BucketKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(self) -> NaiveDate {
        self.0
    }

    /// From days since the Unix epoch (Arrow `Date32`).
    pub fn from_epoch_days(days: i64) -> Option<Self> {
        let ce = i32::try_from(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?).ok()?;
        NaiveDate::from_num_days_from_ce_opt(ce).map(Self)
    }

    /// Truncate a UTC timestamp in microseconds to its day.
    pub fn from_timestamp_micros(micros: i64) -> Option<Self> {
        Self::from_epoch_days(micros.div_euclid(MICROS_PER_DAY))
    }

    pub fn epoch_days(self) -> i64 {
        i64::from(self.0.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// The four running accumulators for one bucket key.
///
/// `total_order_amount` is fixed-point at the run's amount scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateState {
    pub transaction_count: u64,
    pub customer_count: u64,
    pub total_order_amount: i128,
    pub total_order_qty: i128,
}

impl AggregateState {
    pub fn merge(&mut self, other: &AggregateState) {
        self.transaction_count += other.transaction_count;
        self.customer_count += other.customer_count;
        self.total_order_amount += other.total_order_amount;
        self.total_order_qty += other.total_order_qty;
    }
}

/// A set of partial states keyed by day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialAggregate {
    entries: HashMap<BucketKey, AggregateState>,
}

impl PartialAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &BucketKey) -> Option<&AggregateState> {
        self.entries.get(key)
    }

    /// State for `key`, created empty on first touch.
    pub fn entry_mut(&mut self, key: BucketKey) -> &mut AggregateState {
        self.entries.entry(key).or_default()
    }

    pub fn merge_state(&mut self, key: BucketKey, state: &AggregateState) {
        self.entry_mut(key).merge(state);
    }

    pub fn merge(&mut self, other: PartialAggregate) {
        for (key, state) in other.entries {
            self.merge_state(key, &state);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BucketKey, &AggregateState)> {
        self.entries.iter()
    }

    /// Entries ordered by key; the on-disk and comparison form.
    pub fn to_sorted_vec(&self) -> Vec<(BucketKey, AggregateState)> {
        let mut out: Vec<_> = self.entries.iter().map(|(k, v)| (*k, *v)).collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Moves the entries out, leaving an empty map with its capacity released.
    pub fn take(&mut self) -> PartialAggregate {
        std::mem::take(self)
    }
}

impl FromIterator<(BucketKey, AggregateState)> for PartialAggregate {
    fn from_iter<I: IntoIterator<Item = (BucketKey, AggregateState)>>(iter: I) -> Self {
        let mut out = PartialAggregate::new();
        for (k, v) in iter {
            out.merge_state(k, &v);
        }
        out
    }
}

/// One output line: the finalized state of one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    pub date: BucketKey,
    pub transaction_count: u64,
    pub customer_count: u64,
    pub total_order_amount: i128,
    pub total_order_qty: i128,
}

impl ResultRow {
    pub fn from_state(date: BucketKey, state: &AggregateState) -> Self {
        Self {
            date,
            transaction_count: state.transaction_count,
            customer_count: state.customer_count,
            total_order_amount: state.total_order_amount,
            total_order_qty: state.total_order_qty,
        }
    }
}

/// Ordered result rows plus the scale needed to render their amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryTable {
    pub amount_scale: u32,
    pub rows: Vec<ResultRow>,
}

/// Largest supported amount scale; keeps `10^scale` well inside `i128`.
pub const MAX_AMOUNT_SCALE: u32 = 18;

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

/// Convert an `order_amount` value into fixed point at `scale`.
///
/// Nulls contribute zero. Decimals finer than `scale` are refused, since
/// rescaling them would drop digits.
pub fn amount_to_fixed(value: &Scalar, scale: u32) -> Result<i128, String> {
    match value {
        Scalar::Null => Ok(0),
        Scalar::I64(v) => pow10(scale)
            .and_then(|m| i128::from(*v).checked_mul(m))
            .ok_or_else(|| format!("amount {v} overflows at scale {scale}")),
        Scalar::Decimal { value, scale: s } => {
            let s = i32::from(*s);
            let target = scale as i32;
            if s > target {
                return Err(format!(
                    "decimal scale {s} exceeds amount scale {scale}; raise amount_scale"
                ));
            }
            pow10((target - s) as u32)
                .and_then(|m| value.checked_mul(m))
                .ok_or_else(|| format!("decimal amount {value} overflows at scale {scale}"))
        }
        Scalar::F64(f) => {
            if !f.is_finite() {
                return Err(format!("non-finite amount {f}"));
            }
            let scaled = (f * 10f64.powi(scale as i32)).round();
            if scaled.abs() >= 1e37 {
                return Err(format!("amount {f} overflows at scale {scale}"));
            }
            Ok(scaled as i128)
        }
        other => Err(format!("unsupported amount value {}", other.render())),
    }
}

/// Convert an `order_qty` value; nulls contribute zero.
pub fn qty_to_i128(value: &Scalar) -> Result<i128, String> {
    match value {
        Scalar::Null => Ok(0),
        Scalar::I64(v) => Ok(i128::from(*v)),
        other => Err(format!("unsupported quantity value {}", other.render())),
    }
}

/// Render a fixed-point value as a plain decimal without trailing zeros.
pub fn format_fixed(value: i128, scale: u32) -> String {
    let digits = value.unsigned_abs().to_string();
    let scale = scale as usize;
    let (int_part, frac_part) = if digits.len() > scale {
        digits.split_at(digits.len() - scale)
    } else {
        ("0", digits.as_str())
    };
    let mut out = String::with_capacity(digits.len() + 3);
    if value < 0 {
        out.push('-');
    }
    out.push_str(int_part);
    let frac = format!("{:0>width$}", frac_part, width = scale);
    let frac = frac.trim_end_matches('0');
    if !frac.is_empty() {
        out.push('.');
        out.push_str(frac);
    }
    out
}
