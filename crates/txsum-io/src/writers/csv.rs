//! Atomic CSV export of the summary table.
//!
//! Rows go to a temporary file in the target directory, which is synced and
//! renamed over the target only once every row is written. Dropping the
//! writer early (or any error) removes the temporary file, so a failed run
//! never leaves partial output behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use txsum_core::aggregate::{format_fixed, ResultRow, SummaryTable};
use txsum_core::hash::{Hash256, StreamHasher};

use crate::error::{Error, Result};

pub const HEADER: [&str; 5] = [
    "date",
    "transaction_count",
    "customer_count",
    "total_order_amount",
    "total_order_qty",
];

/// Pass-through writer that hashes everything written.
struct HashingWriter<W> {
    inner: W,
    hasher: StreamHasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct CsvSummaryWriter {
    target: PathBuf,
    writer: csv::Writer<HashingWriter<NamedTempFile>>,
    amount_scale: u32,
    rows: u64,
}

impl CsvSummaryWriter {
    /// Open a temporary file next to `path` and write the header.
    pub fn create(path: &Path, amount_scale: u32) -> Result<Self> {
        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let tmp = tempfile::Builder::new()
            .prefix(".txsum-")
            .suffix(".csv.tmp")
            .tempfile_in(parent)?;

        let mut writer = csv::Writer::from_writer(HashingWriter {
            inner: tmp,
            hasher: StreamHasher::new(),
        });
        writer.write_record(HEADER)?;
        Ok(Self {
            target: path.to_path_buf(),
            writer,
            amount_scale,
            rows: 0,
        })
    }

    pub fn write_row(&mut self, row: &ResultRow) -> Result<()> {
        self.writer.write_record([
            row.date.to_string(),
            row.transaction_count.to_string(),
            row.customer_count.to_string(),
            format_fixed(row.total_order_amount, self.amount_scale),
            row.total_order_qty.to_string(),
        ])?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Sync and atomically move the file into place. Returns its digest.
    pub fn finish(self) -> Result<Hash256> {
        let HashingWriter { inner: tmp, hasher } = self
            .writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.target).map_err(|e| Error::Io(e.error))?;
        tracing::debug!(path = %self.target.display(), rows = self.rows, "summary written");
        Ok(hasher.finish())
    }
}

/// Write the whole table to `path`.
pub fn write_summary_csv(table: &SummaryTable, path: &Path) -> Result<Hash256> {
    let mut writer = CsvSummaryWriter::create(path, table.amount_scale)?;
    for row in &table.rows {
        writer.write_row(row)?;
    }
    writer.finish()
}
