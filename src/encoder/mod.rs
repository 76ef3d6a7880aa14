//! Columnar encoder seam
//!
//! The exporter drives an [`Encoder`] through a fixed protocol: `open` once
//! with the final schema, `write_row` once per row in table order, then
//! `close` once. Encoded bytes are handed back incrementally through
//! [`EncoderWriter::take_encoded`] so the exporter can stream them to
//! storage while encoding continues.

mod parquet_encoder;

pub use parquet_encoder::{ParquetEncoder, ParquetEncoderOptions};

use crate::dataframe::{DataFrameRow, DataFrameSchema};
use crate::Result;

use bytes::Bytes;

/// Factory for encoding sessions
pub trait Encoder: Send + Sync {
    /// Short format name, used in logs
    fn format(&self) -> &'static str;

    /// Start encoding a table with `schema`.
    fn open(&self, schema: &DataFrameSchema) -> Result<Box<dyn EncoderWriter>>;
}

/// One encoding session
pub trait EncoderWriter: Send {
    /// Append one row. Any error is fatal to the session.
    fn write_row(&mut self, row: &DataFrameRow) -> Result<()>;

    /// Drain the bytes finalized so far. Returns an empty buffer when none
    /// are ready yet.
    fn take_encoded(&mut self) -> Bytes;

    /// Flush buffered rows, finalize the file and return the remaining
    /// bytes. Everything returned by `take_encoded` followed by these bytes
    /// forms one complete artifact.
    fn close(self: Box<Self>) -> Result<Bytes>;
}
