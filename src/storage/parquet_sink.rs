//! Parquet encoding for snapshot rows.
//!
//! Columns: `ts`, `pair`, `seq`, then `bid_p{r}`, `bid_a{r}`, `ask_p{r}`,
//! `ask_a{r}` for ranks 1..=25 (all nullable Float64). Each append becomes
//! one record batch followed by a row-group flush.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::Compression;
use ::parquet::errors::ParquetError;
use ::parquet::file::properties::WriterProperties;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

use super::{RowSink, SinkFactory, StorageError};
use crate::book::{SnapshotRow, BOOK_DEPTH};

pub const PARQUET_EXTENSION: &str = "parquet";

/// Arrow schema for the wide snapshot layout.
pub fn snapshot_schema() -> Schema {
    let mut fields = Vec::with_capacity(3 + BOOK_DEPTH * 4);
    fields.push(Field::new("ts", DataType::Utf8, false));
    fields.push(Field::new("pair", DataType::Utf8, false));
    fields.push(Field::new("seq", DataType::Int64, true));

    for rank in 1..=BOOK_DEPTH {
        for prefix in ["bid_p", "bid_a", "ask_p", "ask_a"] {
            fields.push(Field::new(format!("{prefix}{rank}"), DataType::Float64, true));
        }
    }

    Schema::new(fields)
}

impl From<ParquetError> for StorageError {
    fn from(err: ParquetError) -> Self {
        match err {
            // I/O failures from the underlying file arrive boxed here.
            ParquetError::External(inner) => match inner.downcast::<io::Error>() {
                Ok(io_err) => StorageError::from_io(*io_err),
                Err(other) => StorageError::Encode(other.to_string()),
            },
            other => StorageError::Encode(other.to_string()),
        }
    }
}

impl From<arrow::error::ArrowError> for StorageError {
    fn from(err: arrow::error::ArrowError) -> Self {
        StorageError::Encode(err.to_string())
    }
}

// =============================================================================
// FACTORY
// =============================================================================

#[derive(Debug, Clone)]
pub struct ParquetSinkFactory {
    schema: SchemaRef,
    compression: Compression,
}

impl Default for ParquetSinkFactory {
    fn default() -> Self {
        Self {
            schema: Arc::new(snapshot_schema()),
            compression: Compression::SNAPPY,
        }
    }
}

impl ParquetSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SinkFactory for ParquetSinkFactory {
    fn extension(&self) -> &str {
        PARQUET_EXTENSION
    }

    fn create(&self, path: &Path) -> Result<Box<dyn RowSink>, StorageError> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let sync_handle = file.try_clone()?;

        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .build();
        let writer = ArrowWriter::try_new(file, self.schema.clone(), Some(props))?;

        Ok(Box::new(ParquetSink {
            path: path.to_path_buf(),
            schema: self.schema.clone(),
            writer,
            sync_handle,
        }))
    }
}

// =============================================================================
// SINK
// =============================================================================

pub struct ParquetSink {
    path: PathBuf,
    schema: SchemaRef,
    writer: ArrowWriter<File>,
    sync_handle: File,
}

impl RowSink for ParquetSink {
    fn append(&mut self, rows: &[SnapshotRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let batch = to_record_batch(self.schema.clone(), rows)?;
        self.writer.write(&batch)?;
        self.writer.flush()?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StorageError> {
        let Self {
            path,
            writer,
            sync_handle,
            ..
        } = *self;
        let meta = writer.close()?;
        sync_handle.sync_all()?;
        debug!(path = %path.display(), rows = meta.num_rows, "parquet file finalized");
        Ok(())
    }
}

fn to_record_batch(schema: SchemaRef, rows: &[SnapshotRow]) -> Result<RecordBatch, StorageError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    columns.push(Arc::new(StringArray::from(
        rows.iter().map(|r| r.ts_string()).collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(StringArray::from(
        rows.iter().map(|r| r.pair.clone()).collect::<Vec<_>>(),
    )));
    columns.push(Arc::new(Int64Array::from(
        rows.iter()
            .map(|r| r.sequence.and_then(|s| i64::try_from(s).ok()))
            .collect::<Vec<_>>(),
    )));

    for rank in 0..BOOK_DEPTH {
        columns.push(float_column(rows, |r| r.bids[rank].price));
        columns.push(float_column(rows, |r| r.bids[rank].amount));
        columns.push(float_column(rows, |r| r.asks[rank].price));
        columns.push(float_column(rows, |r| r.asks[rank].amount));
    }

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn float_column(rows: &[SnapshotRow], field: impl Fn(&SnapshotRow) -> Option<Decimal>) -> ArrayRef {
    Arc::new(Float64Array::from(
        rows.iter()
            .map(|r| field(r).and_then(|v| v.to_f64()))
            .collect::<Vec<Option<f64>>>(),
    ))
}
