//! Lightweight logical value/column model to avoid bringing Arrow into core.
//!
//! The IO layer decodes Parquet into Arrow arrays and converts the projected
//! columns into these types; operators only ever see `Batch`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::id::BatchId;
use crate::schema::DataType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    /// Fixed-point decimal: `value * 10^-scale`.
    Decimal { value: i128, scale: i8 },
    Str(String),
    Bin(Vec<u8>),
    /// Days since 1970-01-01.
    Date32(i32),
    /// Microseconds since 1970-01-01T00:00:00Z.
    TimestampMicros(i64),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Scalar::Null => return None,
            Scalar::Bool(_) => DataType::Boolean,
            Scalar::I64(_) => DataType::Int64,
            Scalar::F64(_) => DataType::Float64,
            Scalar::Decimal { scale, .. } => DataType::Decimal128 {
                precision: 38,
                scale: *scale,
            },
            Scalar::Str(_) => DataType::Utf8,
            Scalar::Bin(_) => DataType::Binary,
            Scalar::Date32(_) => DataType::Date32,
            Scalar::TimestampMicros(_) => DataType::TimestampMicros,
        })
    }

    /// Raw rendering used in error messages (e.g. unparseable timestamps).
    pub fn render(&self) -> String {
        match self {
            Scalar::Null => "NULL".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::I64(i) => i.to_string(),
            Scalar::F64(f) => f.to_string(),
            Scalar::Decimal { value, scale } => format!("{value}e-{scale}"),
            Scalar::Str(s) => s.clone(),
            Scalar::Bin(b) => format!("[binary {} bytes]", b.len()),
            Scalar::Date32(d) => format!("date32({d})"),
            Scalar::TimestampMicros(t) => format!("timestamp_us({t})"),
        }
    }
}

/// Minimal column representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Scalar>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Scalar>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }
}

/// Columnar chunk of rows sharing one schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowBatch {
    pub columns: Vec<Column>,
}

impl RowBatch {
    pub fn new(columns: Vec<Column>) -> Result<Self, String> {
        if let Some(first) = columns.first() {
            if let Some(bad) = columns.iter().find(|c| c.len() != first.len()) {
                return Err(format!(
                    "column '{}' has {} rows; expected {}",
                    bad.name,
                    bad.len(),
                    first.len()
                ));
            }
        }
        Ok(Self { columns })
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A batch as produced by a batch source: rows plus provenance.
///
/// Never mutated after creation; the partition path is shared between all
/// batches decoded from the same file.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub partition: Arc<str>,
    pub rows: RowBatch,
}

impl Batch {
    pub fn new(id: BatchId, partition: Arc<str>, rows: RowBatch) -> Self {
        Self {
            id,
            partition,
            rows,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.num_rows()
    }
}
