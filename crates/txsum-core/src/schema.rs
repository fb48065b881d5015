//! Logical schema types. Pure data; no Arrow dependency here.
//!
//! The IO layer maps each physical (Arrow/Parquet) column type onto one of
//! these logical types; the mapping is the "simple cast" a partition may need.
//! Anything that does not map, or maps onto a type the column's role cannot
//! use, is a schema mismatch.

use serde::{Deserialize, Serialize};

pub const TRANSACTION_ID: &str = "transaction_id";
pub const CUSTOMER_ID: &str = "customer_id";
pub const ORDER_AMOUNT: &str = "order_amount";
pub const ORDER_QTY: &str = "order_qty";
pub const DATETIME: &str = "datetime";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Decimal128 { precision: u8, scale: i8 },
    Utf8,
    Binary,
    Date32,
    TimestampMicros,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_named(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A column the pipeline needs, with the logical types it can consume.
#[derive(Debug, Clone, Copy)]
pub struct ColumnRequirement {
    pub name: &'static str,
    pub expected: &'static str,
    accepts: fn(&DataType) -> bool,
}

impl ColumnRequirement {
    pub fn accepts(&self, data_type: &DataType) -> bool {
        (self.accepts)(data_type)
    }
}

fn any_identifier(t: &DataType) -> bool {
    matches!(t, DataType::Int64 | DataType::Utf8 | DataType::Binary)
}

fn numeric(t: &DataType) -> bool {
    matches!(
        t,
        DataType::Int64 | DataType::Float64 | DataType::Decimal128 { .. }
    )
}

fn integer(t: &DataType) -> bool {
    matches!(t, DataType::Int64)
}

fn temporal(t: &DataType) -> bool {
    matches!(
        t,
        DataType::TimestampMicros | DataType::Date32 | DataType::Utf8
    )
}

/// The column set every partition must provide.
pub const REQUIRED_COLUMNS: [ColumnRequirement; 5] = [
    ColumnRequirement {
        name: TRANSACTION_ID,
        expected: "integer, string or binary",
        accepts: any_identifier,
    },
    ColumnRequirement {
        name: CUSTOMER_ID,
        expected: "integer, string or binary",
        accepts: any_identifier,
    },
    ColumnRequirement {
        name: ORDER_AMOUNT,
        expected: "integer, float or decimal",
        accepts: numeric,
    },
    ColumnRequirement {
        name: ORDER_QTY,
        expected: "integer",
        accepts: integer,
    },
    ColumnRequirement {
        name: DATETIME,
        expected: "timestamp, date or string",
        accepts: temporal,
    },
];

/// Check that `schema` carries every required column with a usable type.
///
/// Returns a human-readable reason on failure; callers attach the partition.
pub fn check_required(schema: &Schema) -> Result<(), String> {
    for req in REQUIRED_COLUMNS.iter() {
        match schema.field_named(req.name) {
            None => return Err(format!("missing required column '{}'", req.name)),
            Some(f) if !req.accepts(&f.data_type) => {
                return Err(format!(
                    "column '{}' has type {:?}; expected {}",
                    req.name, f.data_type, req.expected
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Logical schema of a well-formed transactions partition.
pub fn transactions_schema() -> Schema {
    Schema::new(vec![
        Field::new(TRANSACTION_ID, DataType::Int64, true),
        Field::new(CUSTOMER_ID, DataType::Int64, true),
        Field::new(
            ORDER_AMOUNT,
            DataType::Decimal128 {
                precision: 18,
                scale: 2,
            },
            true,
        ),
        Field::new(ORDER_QTY, DataType::Int64, true),
        Field::new(DATETIME, DataType::TimestampMicros, true),
    ])
}
