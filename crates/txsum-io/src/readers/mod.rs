//! Readers that turn decoded partitions into `RowBatch` chunks.

pub mod parquet;
