//! Tabular view of aggregated series
//!
//! The table has one row per non-empty (series, bucket) and the columns:
//! every label name seen in the series set (first-seen order), the bucket
//! start timestamp, then one column per enabled aggregation function.
//!
//! The schema is discovered in a first pass over the series' label sets,
//! before any sample is read, so it is fixed by the time the first row is
//! produced.

use crate::aggregate::{AggregatedBucket, AggregationConfig, AggregationFunction, AggregationResult};
use crate::series::{LabelSet, SeriesSet};
use crate::{Error, Result, Stage};

use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the bucket start column
pub const BUCKET_START_FIELD: &str = "_bucket_start";

/// Fixed table layout for one export
#[derive(Debug, Clone)]
pub struct DataFrameSchema {
    label_names: Vec<String>,
    label_index: HashMap<String, usize>,
    functions: Vec<AggregationFunction>,
    arrow: SchemaRef,
}

impl DataFrameSchema {
    /// Derive the schema from the label sets of `series_set`.
    pub fn discover(series_set: &SeriesSet, config: &AggregationConfig) -> Result<Self> {
        Self::from_label_sets(series_set.iter().map(|s| &s.labels), config.functions())
    }

    /// Derive the schema from label sets in series order.
    pub fn from_label_sets<'a>(
        label_sets: impl IntoIterator<Item = &'a LabelSet>,
        functions: &[AggregationFunction],
    ) -> Result<Self> {
        let mut label_names: Vec<String> = Vec::new();
        let mut label_index: HashMap<String, usize> = HashMap::new();
        for labels in label_sets {
            for name in labels.names() {
                if !label_index.contains_key(name) {
                    label_index.insert(name.to_string(), label_names.len());
                    label_names.push(name.to_string());
                }
            }
        }
        Self::build(label_names, label_index, functions)
    }

    /// Schema with an explicit list of label columns.
    pub fn new(label_names: Vec<String>, functions: &[AggregationFunction]) -> Result<Self> {
        let mut label_index = HashMap::with_capacity(label_names.len());
        for (i, name) in label_names.iter().enumerate() {
            if label_index.insert(name.clone(), i).is_some() {
                return Err(Error::Schema(format!("duplicate label column '{}'", name)));
            }
        }
        Self::build(label_names, label_index, functions)
    }

    fn build(
        label_names: Vec<String>,
        label_index: HashMap<String, usize>,
        functions: &[AggregationFunction],
    ) -> Result<Self> {
        let reserved: Vec<&str> = std::iter::once(BUCKET_START_FIELD)
            .chain(functions.iter().map(|f| f.column_name()))
            .collect();
        if let Some(name) = label_names.iter().find(|n| reserved.contains(&n.as_str())) {
            return Err(Error::Schema(format!(
                "label '{}' collides with a reserved column name",
                name
            )));
        }

        let mut fields: Vec<Field> = label_names
            .iter()
            .map(|name| Field::new(name, DataType::Utf8, true))
            .collect();

        fields.push(Field::new(
            BUCKET_START_FIELD,
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ));

        for function in functions {
            fields.push(Field::new(
                function.column_name(),
                function.data_type(),
                function.nullable(),
            ));
        }

        Ok(Self {
            label_names,
            label_index,
            functions: functions.to_vec(),
            arrow: Arc::new(Schema::new(fields)),
        })
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    pub fn label_position(&self, name: &str) -> Option<usize> {
        self.label_index.get(name).copied()
    }

    pub fn functions(&self) -> &[AggregationFunction] {
        &self.functions
    }

    /// Get the Arrow schema
    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow.clone()
    }

    pub fn num_columns(&self) -> usize {
        self.arrow.fields().len()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.arrow.fields().iter().map(|f| f.name().clone()).collect()
    }
}

/// One table row
///
/// `labels` follows the schema's label columns; `None` marks a label the
/// row's series does not carry.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrameRow {
    pub labels: Arc<[Option<String>]>,
    pub bucket_start_ms: i64,
    pub values: AggregationResult,
}

impl DataFrameRow {
    pub fn label(&self, position: usize) -> Option<&str> {
        self.labels.get(position).and_then(|v| v.as_deref())
    }
}

/// Projects aggregator output onto a [`DataFrameSchema`]
///
/// The label projection is computed once per series and shared by all of
/// its rows.
#[derive(Debug)]
pub struct DataFrameBuilder {
    schema: DataFrameSchema,
    current: Option<(Arc<LabelSet>, Arc<[Option<String>]>)>,
}

impl DataFrameBuilder {
    pub fn new(schema: DataFrameSchema) -> Self {
        Self {
            schema,
            current: None,
        }
    }

    pub fn schema(&self) -> &DataFrameSchema {
        &self.schema
    }

    /// Turn one aggregated bucket into a row.
    pub fn row(&mut self, bucket: AggregatedBucket) -> Result<DataFrameRow> {
        let labels = match &self.current {
            Some((set, projected)) if Arc::ptr_eq(set, &bucket.labels) => Arc::clone(projected),
            _ => {
                let projected = self.project(&bucket.labels)?;
                self.current = Some((Arc::clone(&bucket.labels), Arc::clone(&projected)));
                projected
            }
        };

        Ok(DataFrameRow {
            labels,
            bucket_start_ms: bucket.bucket.start_ms,
            values: bucket.result,
        })
    }

    fn project(&self, labels: &LabelSet) -> Result<Arc<[Option<String>]>> {
        let mut projected: Vec<Option<String>> = vec![None; self.schema.label_names.len()];
        for label in labels.iter() {
            let position = self.schema.label_position(&label.name).ok_or_else(|| {
                Error::Schema(format!(
                    "series {} has label '{}' missing from the table schema",
                    labels, label.name
                ))
            })?;
            projected[position] = Some(label.value.clone());
        }
        Ok(projected.into())
    }

    /// Map a stream of aggregated buckets into rows, preserving order.
    pub fn build<S>(mut self, buckets: S) -> BoxStream<'static, Result<DataFrameRow>>
    where
        S: Stream<Item = Result<AggregatedBucket>> + Send + 'static,
    {
        buckets
            .map(move |item| item.and_then(|bucket| self.row(bucket).map_err(|e| e.in_stage(Stage::Build))))
            .boxed()
    }
}
