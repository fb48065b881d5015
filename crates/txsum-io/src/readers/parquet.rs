//! Arrow to `RowBatch` conversion for Parquet partitions.
//!
//! Only the required columns are decoded. Each Arrow type maps onto one
//! logical type; anything else is a schema mismatch for the partition.

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Date64Type, Decimal128Type, Float32Type, Float64Type, Int16Type, Int32Type,
    Int64Type, Int8Type, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{Array, ArrowPrimitiveType, RecordBatch};
use arrow_schema::{DataType as ArrowType, Schema as ArrowSchema, TimeUnit};
use parquet::arrow::ProjectionMask;
use parquet::schema::types::SchemaDescriptor;
use txsum_core::schema::{check_required, DataType, Field, Schema, REQUIRED_COLUMNS};
use txsum_core::types::{Column, RowBatch, Scalar};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Logical type of an Arrow column, if the pipeline can read it.
pub fn logical_type(arrow: &ArrowType) -> Option<DataType> {
    Some(match arrow {
        ArrowType::Boolean => DataType::Boolean,
        ArrowType::Int8
        | ArrowType::Int16
        | ArrowType::Int32
        | ArrowType::Int64
        | ArrowType::UInt8
        | ArrowType::UInt16
        | ArrowType::UInt32
        | ArrowType::UInt64 => DataType::Int64,
        ArrowType::Float32 | ArrowType::Float64 => DataType::Float64,
        ArrowType::Decimal128(precision, scale) => DataType::Decimal128 {
            precision: *precision,
            scale: *scale,
        },
        ArrowType::Utf8 | ArrowType::LargeUtf8 => DataType::Utf8,
        ArrowType::Binary | ArrowType::LargeBinary | ArrowType::FixedSizeBinary(_) => {
            DataType::Binary
        }
        ArrowType::Date32 | ArrowType::Date64 => DataType::Date32,
        ArrowType::Timestamp(_, _) => DataType::TimestampMicros,
        // Dictionary columns read as their value type.
        ArrowType::Dictionary(_, value) => return logical_type(value),
        _ => return None,
    })
}

/// Map the required columns of an Arrow schema onto the logical schema and
/// check them. Returns the reason on failure.
pub fn required_schema(arrow: &ArrowSchema) -> Result<Schema, String> {
    let mut fields = Vec::with_capacity(REQUIRED_COLUMNS.len());
    for req in REQUIRED_COLUMNS.iter() {
        let field = arrow
            .field_with_name(req.name)
            .map_err(|_| format!("missing required column '{}'", req.name))?;
        let data_type = logical_type(field.data_type()).ok_or_else(|| {
            format!(
                "column '{}' has unsupported type {}; expected {}",
                req.name,
                field.data_type(),
                req.expected
            )
        })?;
        fields.push(Field::new(req.name, data_type, field.is_nullable()));
    }
    let schema = Schema::new(fields);
    check_required(&schema)?;
    Ok(schema)
}

/// Projection that decodes only the required root columns.
pub fn projection(parquet: &SchemaDescriptor, arrow: &ArrowSchema) -> Result<ProjectionMask, String> {
    required_schema(arrow)?;
    let roots = REQUIRED_COLUMNS
        .iter()
        .map(|req| {
            arrow
                .index_of(req.name)
                .map_err(|_| format!("missing required column '{}'", req.name))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ProjectionMask::roots(parquet, roots))
}

fn primitive<T, F>(array: &dyn Array, convert: F) -> Result<Vec<Scalar>, String>
where
    T: ArrowPrimitiveType,
    F: Fn(T::Native) -> Result<Scalar, String>,
{
    let values = array.as_primitive::<T>();
    (0..values.len())
        .map(|i| {
            if values.is_null(i) {
                Ok(Scalar::Null)
            } else {
                convert(values.value(i))
            }
        })
        .collect()
}

fn nullable<V>(
    array: &dyn Array,
    values: impl Iterator<Item = Option<V>>,
    convert: impl Fn(V) -> Scalar,
) -> Vec<Scalar> {
    let mut out = Vec::with_capacity(array.len());
    out.extend(values.map(|v| v.map_or(Scalar::Null, &convert)));
    out
}

fn int<N: Into<i64>>(v: N) -> Result<Scalar, String> {
    Ok(Scalar::I64(v.into()))
}

fn scaled_micros(v: i64, factor: i64) -> Result<Scalar, String> {
    v.checked_mul(factor)
        .map(Scalar::TimestampMicros)
        .ok_or_else(|| format!("timestamp {v} out of range"))
}

/// Convert one Arrow array into logical scalars.
pub fn array_to_scalars(array: &dyn Array) -> Result<Vec<Scalar>, String> {
    match array.data_type() {
        ArrowType::Boolean => Ok(nullable(array, array.as_boolean().iter(), Scalar::Bool)),
        ArrowType::Int8 => primitive::<Int8Type, _>(array, int),
        ArrowType::Int16 => primitive::<Int16Type, _>(array, int),
        ArrowType::Int32 => primitive::<Int32Type, _>(array, int),
        ArrowType::Int64 => primitive::<Int64Type, _>(array, int),
        ArrowType::UInt8 => primitive::<UInt8Type, _>(array, int),
        ArrowType::UInt16 => primitive::<UInt16Type, _>(array, int),
        ArrowType::UInt32 => primitive::<UInt32Type, _>(array, int),
        ArrowType::UInt64 => primitive::<UInt64Type, _>(array, |v| {
            i64::try_from(v)
                .map(Scalar::I64)
                .map_err(|_| format!("unsigned value {v} exceeds i64"))
        }),
        ArrowType::Float32 => primitive::<Float32Type, _>(array, |v| Ok(Scalar::F64(f64::from(v)))),
        ArrowType::Float64 => primitive::<Float64Type, _>(array, |v| Ok(Scalar::F64(v))),
        ArrowType::Decimal128(_, scale) => {
            let scale = *scale;
            primitive::<Decimal128Type, _>(array, |value| Ok(Scalar::Decimal { value, scale }))
        }
        ArrowType::Utf8 => Ok(nullable(array, array.as_string::<i32>().iter(), |s| {
            Scalar::Str(s.to_string())
        })),
        ArrowType::LargeUtf8 => Ok(nullable(array, array.as_string::<i64>().iter(), |s| {
            Scalar::Str(s.to_string())
        })),
        ArrowType::Binary => Ok(nullable(array, array.as_binary::<i32>().iter(), |b| {
            Scalar::Bin(b.to_vec())
        })),
        ArrowType::LargeBinary => Ok(nullable(array, array.as_binary::<i64>().iter(), |b| {
            Scalar::Bin(b.to_vec())
        })),
        ArrowType::FixedSizeBinary(_) => Ok(nullable(
            array,
            array.as_fixed_size_binary().iter(),
            |b| Scalar::Bin(b.to_vec()),
        )),
        ArrowType::Date32 => primitive::<Date32Type, _>(array, |d| Ok(Scalar::Date32(d))),
        ArrowType::Date64 => primitive::<Date64Type, _>(array, |ms| {
            i32::try_from(ms.div_euclid(MILLIS_PER_DAY))
                .map(Scalar::Date32)
                .map_err(|_| format!("date64 value {ms} out of range"))
        }),
        // Instants are stored relative to UTC whatever the zone annotation.
        ArrowType::Timestamp(TimeUnit::Second, _) => {
            primitive::<TimestampSecondType, _>(array, |v| scaled_micros(v, 1_000_000))
        }
        ArrowType::Timestamp(TimeUnit::Millisecond, _) => {
            primitive::<TimestampMillisecondType, _>(array, |v| scaled_micros(v, 1_000))
        }
        ArrowType::Timestamp(TimeUnit::Microsecond, _) => {
            primitive::<TimestampMicrosecondType, _>(array, |v| Ok(Scalar::TimestampMicros(v)))
        }
        ArrowType::Timestamp(TimeUnit::Nanosecond, _) => {
            primitive::<TimestampNanosecondType, _>(array, |v| {
                Ok(Scalar::TimestampMicros(v.div_euclid(1_000)))
            })
        }
        ArrowType::Dictionary(_, value) => {
            let unpacked = arrow_cast::cast::cast(array, value)
                .map_err(|e| format!("cannot unpack dictionary: {e}"))?;
            array_to_scalars(unpacked.as_ref())
        }
        other => Err(format!("unsupported arrow type {other}")),
    }
}

/// Convert a decoded record batch into a `RowBatch`, column by column.
pub fn record_batch_to_rows(batch: &RecordBatch) -> Result<RowBatch, String> {
    let schema = batch.schema();
    let columns = schema
        .fields()
        .iter()
        .zip(batch.columns())
        .map(|(field, array)| {
            array_to_scalars(array.as_ref())
                .map(|values| Column::new(field.name().as_str(), values))
                .map_err(|e| format!("column '{}': {e}", field.name()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    RowBatch::new(columns)
}
