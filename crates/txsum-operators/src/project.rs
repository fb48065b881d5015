//! Schema projection: derive the date bucket of every row.
//!
//! Native timestamps and dates truncate directly. Strings are parsed against
//! exactly one declared chrono format; a format without time fields parses
//! as a plain date, and a format with an offset (`%z`) is normalized to UTC.

use chrono::format::ParseErrorKind;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use txsum_core::aggregate::BucketKey;
use txsum_core::config::TimestampPolicy;
use txsum_core::error::{Error, Result};
use txsum_core::schema::{DATETIME, REQUIRED_COLUMNS};
use txsum_core::types::{Batch, Scalar};

/// A batch plus the bucket of each row. `None` marks a skipped row.
#[derive(Debug, Clone)]
pub struct KeyedBatch {
    pub batch: Batch,
    pub keys: Vec<Option<BucketKey>>,
    pub skipped: usize,
}

impl KeyedBatch {
    pub fn num_rows(&self) -> usize {
        self.keys.len()
    }
}

pub struct SchemaProjector {
    format: String,
    has_offset: bool,
    policy: TimestampPolicy,
    skipped_total: u64,
}

impl SchemaProjector {
    pub fn new(format: impl Into<String>, policy: TimestampPolicy) -> Self {
        let format = format.into();
        let has_offset = format.contains("%z") || format.contains("%:z") || format.contains("%#z");
        Self {
            format,
            has_offset,
            policy,
            skipped_total: 0,
        }
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }

    /// Rows skipped so far under `TimestampPolicy::Skip`.
    pub fn skipped_total(&self) -> u64 {
        self.skipped_total
    }

    fn parse_str(&self, raw: &str) -> Option<BucketKey> {
        if self.has_offset {
            return DateTime::parse_from_str(raw, &self.format)
                .ok()
                .map(|dt| BucketKey::new(dt.naive_utc().date()));
        }
        match NaiveDateTime::parse_from_str(raw, &self.format) {
            Ok(dt) => Some(BucketKey::new(dt.date())),
            Err(e) if e.kind() == ParseErrorKind::NotEnough => {
                NaiveDate::parse_from_str(raw, &self.format)
                    .ok()
                    .map(BucketKey::new)
            }
            Err(_) => None,
        }
    }

    /// Bucket of one `datetime` value, or `None` if it cannot be derived.
    pub fn key_for(&self, value: &Scalar) -> Option<BucketKey> {
        match value {
            Scalar::TimestampMicros(us) => BucketKey::from_timestamp_micros(*us),
            Scalar::Date32(days) => BucketKey::from_epoch_days(i64::from(*days)),
            Scalar::Str(s) => self.parse_str(s),
            _ => None,
        }
    }

    /// Derive the bucket of every row of `batch`.
    pub fn project(&mut self, batch: Batch) -> Result<KeyedBatch> {
        for req in REQUIRED_COLUMNS.iter() {
            if batch.rows.column(req.name).is_none() {
                return Err(Error::schema_mismatch(
                    &*batch.partition,
                    format!("missing required column '{}'", req.name),
                ));
            }
        }
        let column = batch.rows.column(DATETIME).ok_or_else(|| {
            Error::schema_mismatch(&*batch.partition, "missing required column 'datetime'")
        })?;

        let mut keys = Vec::with_capacity(column.len());
        let mut skipped = 0usize;
        for value in &column.values {
            match self.key_for(value) {
                Some(key) => keys.push(Some(key)),
                None if self.policy == TimestampPolicy::Skip => {
                    skipped += 1;
                    keys.push(None);
                }
                None => {
                    return Err(Error::InvalidTimestamp {
                        raw: value.render(),
                        batch: batch.id,
                        partition: batch.partition.to_string(),
                    })
                }
            }
        }

        if skipped > 0 {
            self.skipped_total += skipped as u64;
            tracing::warn!(
                batch = %batch.id,
                partition = %batch.partition,
                skipped,
                format = %self.format,
                "skipped rows with unparseable datetime"
            );
        }
        Ok(KeyedBatch {
            batch,
            keys,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use txsum_core::id::BatchId;
    use txsum_core::types::{Column, RowBatch};

    fn key(s: &str) -> BucketKey {
        BucketKey::new(NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn batch(datetimes: Vec<Scalar>) -> Batch {
        let n = datetimes.len();
        let rows = RowBatch::new(vec![
            Column::new("transaction_id", vec![Scalar::I64(1); n]),
            Column::new("customer_id", vec![Scalar::I64(1); n]),
            Column::new("order_amount", vec![Scalar::I64(1); n]),
            Column::new("order_qty", vec![Scalar::I64(1); n]),
            Column::new("datetime", datetimes),
        ])
        .unwrap();
        Batch::new(BatchId::new(7), Arc::from("memory://tx/a.parquet"), rows)
    }

    #[test]
    fn native_values_truncate_to_the_day() {
        let p = SchemaProjector::new("%Y-%m-%d %H:%M:%S", TimestampPolicy::Abort);
        // 2024-01-01T23:59:59.999999Z
        assert_eq!(
            p.key_for(&Scalar::TimestampMicros(1_704_153_599_999_999)),
            Some(key("2024-01-01"))
        );
        assert_eq!(
            p.key_for(&Scalar::TimestampMicros(-1)),
            Some(key("1969-12-31"))
        );
        assert_eq!(p.key_for(&Scalar::Date32(19_724)), Some(key("2024-01-02")));
    }

    #[test]
    fn strings_parse_against_the_declared_format_only() {
        let p = SchemaProjector::new("%Y-%m-%d %H:%M:%S", TimestampPolicy::Abort);
        assert_eq!(
            p.key_for(&Scalar::Str("2024-03-05 10:11:12".into())),
            Some(key("2024-03-05"))
        );
        assert_eq!(p.key_for(&Scalar::Str("03/05/2024 10:11:12".into())), None);
        assert_eq!(p.key_for(&Scalar::Null), None);

        let dates = SchemaProjector::new("%Y-%m-%d", TimestampPolicy::Abort);
        assert_eq!(
            dates.key_for(&Scalar::Str("2024-03-05".into())),
            Some(key("2024-03-05"))
        );

        let zoned = SchemaProjector::new("%Y-%m-%d %H:%M:%S%z", TimestampPolicy::Abort);
        assert_eq!(
            zoned.key_for(&Scalar::Str("2024-03-05 23:30:00-0200".into())),
            Some(key("2024-03-06"))
        );
    }

    #[test]
    fn abort_policy_reports_the_raw_value() {
        let mut p = SchemaProjector::new("%Y-%m-%d %H:%M:%S", TimestampPolicy::Abort);
        let err = p
            .project(batch(vec![
                Scalar::Str("2024-01-01 00:00:00".into()),
                Scalar::Str("yesterday".into()),
            ]))
            .unwrap_err();
        match err {
            Error::InvalidTimestamp {
                raw,
                batch,
                partition,
            } => {
                assert_eq!(raw, "yesterday");
                assert_eq!(batch, BatchId::new(7));
                assert_eq!(partition, "memory://tx/a.parquet");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn skip_policy_counts_skipped_rows() {
        let mut p = SchemaProjector::new("%Y-%m-%d %H:%M:%S", TimestampPolicy::Skip);
        let keyed = p
            .project(batch(vec![
                Scalar::Str("2024-01-01 00:00:00".into()),
                Scalar::Null,
                Scalar::Str("bad".into()),
            ]))
            .unwrap();
        assert_eq!(keyed.keys, vec![Some(key("2024-01-01")), None, None]);
        assert_eq!(keyed.skipped, 2);
        assert_eq!(p.skipped_total(), 2);
    }

    #[test]
    fn missing_columns_are_schema_mismatches() {
        let rows = RowBatch::new(vec![Column::new("datetime", vec![Scalar::Date32(0)])]).unwrap();
        let b = Batch::new(BatchId::new(0), Arc::from("p"), rows);
        let mut p = SchemaProjector::new("%Y-%m-%d", TimestampPolicy::Abort);
        assert!(matches!(p.project(b), Err(Error::SchemaMismatch { .. })));
    }
}
