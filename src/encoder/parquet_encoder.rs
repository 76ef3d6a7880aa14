//! Parquet encoder with settings tuned for aggregated metrics
//!
//! Rows are staged in Arrow builders, converted to record batches of
//! `batch_size` rows and fed to an [`ArrowWriter`], which buffers up to
//! `row_group_size` rows before writing a row group. Bytes the writer has
//! emitted are drained after every row, so memory stays bounded by one row
//! group plus one batch.

use super::{Encoder, EncoderWriter};
use crate::aggregate::{AggregateValue, AggregationFunction};
use crate::dataframe::{DataFrameRow, DataFrameSchema};
use crate::{Error, Result};

use arrow_array::builder::{Float64Builder, StringBuilder, TimestampMillisecondBuilder, UInt64Builder};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::SchemaRef;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use std::sync::Arc;

/// Tuning knobs for [`ParquetEncoder`]
#[derive(Debug, Clone)]
pub struct ParquetEncoderOptions {
    /// Maximum rows per row group
    pub row_group_size: usize,
    /// Rows staged in builders before they are handed to the writer
    pub batch_size: usize,
    /// ZSTD compression level
    pub zstd_level: i32,
}

impl Default for ParquetEncoderOptions {
    fn default() -> Self {
        Self {
            row_group_size: 128 * 1024,
            batch_size: 8192,
            zstd_level: 3,
        }
    }
}

/// Encodes tables as Parquet files
#[derive(Debug, Clone)]
pub struct ParquetEncoder {
    options: ParquetEncoderOptions,
}

impl ParquetEncoder {
    pub fn new() -> Self {
        Self::with_options(ParquetEncoderOptions::default())
    }

    pub fn with_options(options: ParquetEncoderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ParquetEncoderOptions {
        &self.options
    }

    /// Build writer properties for aggregated time-series tables
    fn build_writer_properties(&self) -> Result<WriterProperties> {
        let level = ZstdLevel::try_new(self.options.zstd_level)?;
        Ok(WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_compression(Compression::ZSTD(level))
            // Label columns repeat heavily across buckets of one series
            .set_dictionary_enabled(true)
            .set_max_row_group_size(self.options.row_group_size.max(1))
            .set_statistics_enabled(EnabledStatistics::Page)
            .set_bloom_filter_enabled(false)
            .set_data_page_size_limit(1024 * 1024)
            .build())
    }
}

impl Default for ParquetEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for ParquetEncoder {
    fn format(&self) -> &'static str {
        "parquet"
    }

    fn open(&self, schema: &DataFrameSchema) -> Result<Box<dyn EncoderWriter>> {
        let props = self.build_writer_properties()?;
        let arrow_schema = schema.arrow_schema();
        let writer = ArrowWriter::try_new(Vec::new(), Arc::clone(&arrow_schema), Some(props))?;

        let batch_size = self.options.batch_size.max(1);
        let values = schema
            .functions()
            .iter()
            .map(|function| match function {
                AggregationFunction::Count => {
                    ValueBuilder::Count(UInt64Builder::with_capacity(batch_size))
                }
                other => ValueBuilder::Float(*other, Float64Builder::with_capacity(batch_size)),
            })
            .collect();

        Ok(Box::new(ParquetRowWriter {
            schema: arrow_schema,
            labels: (0..schema.label_names().len())
                .map(|_| StringBuilder::new())
                .collect(),
            bucket_start: TimestampMillisecondBuilder::with_capacity(batch_size).with_timezone("UTC"),
            values,
            functions: schema.functions().to_vec(),
            pending_rows: 0,
            batch_size,
            writer: Some(writer),
        }))
    }
}

/// Column builder for one aggregation function
enum ValueBuilder {
    Count(UInt64Builder),
    Float(AggregationFunction, Float64Builder),
}

struct ParquetRowWriter {
    schema: SchemaRef,
    labels: Vec<StringBuilder>,
    bucket_start: TimestampMillisecondBuilder,
    values: Vec<ValueBuilder>,
    functions: Vec<AggregationFunction>,
    pending_rows: usize,
    batch_size: usize,
    writer: Option<ArrowWriter<Vec<u8>>>,
}

impl ParquetRowWriter {
    fn writer_mut(&mut self) -> Result<&mut ArrowWriter<Vec<u8>>> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::Encoding("parquet writer is closed".to_string()))
    }

    /// Move staged rows into the Arrow writer as one record batch.
    fn flush_batch(&mut self) -> Result<()> {
        if self.pending_rows == 0 {
            return Ok(());
        }

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.schema.fields().len());
        for builder in &mut self.labels {
            columns.push(Arc::new(builder.finish()));
        }
        columns.push(Arc::new(self.bucket_start.finish()));
        for builder in &mut self.values {
            match builder {
                ValueBuilder::Count(b) => columns.push(Arc::new(b.finish())),
                ValueBuilder::Float(_, b) => columns.push(Arc::new(b.finish())),
            }
        }

        let batch = RecordBatch::try_new(Arc::clone(&self.schema), columns)?;
        self.pending_rows = 0;
        self.writer_mut()?.write(&batch)?;
        Ok(())
    }
}

impl EncoderWriter for ParquetRowWriter {
    fn write_row(&mut self, row: &DataFrameRow) -> Result<()> {
        if row.labels.len() != self.labels.len() {
            return Err(Error::Encoding(format!(
                "row has {} label values, schema has {} label columns",
                row.labels.len(),
                self.labels.len()
            )));
        }
        if self.writer.is_none() {
            return Err(Error::Encoding("parquet writer is closed".to_string()));
        }

        for (builder, value) in self.labels.iter_mut().zip(row.labels.iter()) {
            builder.append_option(value.as_deref());
        }
        self.bucket_start.append_value(row.bucket_start_ms);

        for (builder, function) in self.values.iter_mut().zip(self.functions.iter()) {
            match (builder, row.values.get(*function)) {
                (ValueBuilder::Count(b), Some(AggregateValue::Count(count))) => b.append_value(count),
                (ValueBuilder::Count(_), _) => {
                    return Err(Error::Encoding(
                        "count column requires a value for every row".to_string(),
                    ));
                }
                (ValueBuilder::Float(_, b), Some(AggregateValue::Float(v))) => b.append_value(v),
                (ValueBuilder::Float(_, b), None) => b.append_null(),
                (ValueBuilder::Float(f, _), Some(AggregateValue::Count(_))) => {
                    return Err(Error::Encoding(format!(
                        "unexpected count value for column {}",
                        f.column_name()
                    )));
                }
            }
        }

        self.pending_rows += 1;
        if self.pending_rows >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn take_encoded(&mut self) -> Bytes {
        match self.writer.as_mut() {
            Some(writer) => Bytes::from(std::mem::take(writer.inner_mut())),
            None => Bytes::new(),
        }
    }

    fn close(mut self: Box<Self>) -> Result<Bytes> {
        self.flush_batch()?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Encoding("parquet writer is closed".to_string()))?;
        let tail = writer.into_inner()?;
        Ok(Bytes::from(tail))
    }
}
