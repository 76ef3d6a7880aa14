//! Shared helpers for obsframe integration tests
//!
//! Test doubles for the series and storage seams plus Parquet read-back.

#![allow(dead_code)]

use obsframe::context::ExportContext;
use obsframe::series::{LabelSet, ReadParams, Sample, Series, SeriesReader, SeriesSet};
use obsframe::storage::{ArtifactWriter, Destination, StorageBackend};
use obsframe::{Error, Result};

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, TimestampMillisecondType, UInt64Type};
use arrow_array::{Array, RecordBatch};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    LabelSet::from_pairs(pairs.iter().copied()).unwrap()
}

pub fn samples(points: &[(i64, f64)]) -> Vec<Sample> {
    points.iter().map(|&(t, v)| Sample::new(t, v)).collect()
}

/// Series reader that builds a fresh series set on every read
pub struct ScriptedReader {
    make: Box<dyn Fn() -> Result<SeriesSet> + Send + Sync>,
    pub reads: AtomicUsize,
}

impl ScriptedReader {
    pub fn new(make: impl Fn() -> Result<SeriesSet> + Send + Sync + 'static) -> Self {
        Self {
            make: Box::new(make),
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SeriesReader for ScriptedReader {
    async fn read(&self, _ctx: &ExportContext, _params: &ReadParams) -> Result<SeriesSet> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        (self.make)()
    }
}

/// A series whose sample stream sleeps `delay` before every sample
pub fn slow_series(labels: LabelSet, points: Vec<Sample>, delay: std::time::Duration) -> Series {
    let stream = stream::iter(points)
        .then(move |sample| async move {
            tokio::time::sleep(delay).await;
            Ok(sample)
        })
        .boxed();
    Series::new(labels, stream)
}

/// A series that runs `hook` when first polled and then never yields
pub fn stalling_series(labels: LabelSet, hook: impl FnOnce() + Send + 'static) -> Series {
    let stream = stream::once(async move {
        hook();
        std::future::pending::<Result<Sample>>().await
    })
    .boxed();
    Series::new(labels, stream)
}

/// Backend whose writers fail on the first write, on commit with
/// `fail_commit`, or that cannot open a writer at all with `fail_open`
#[derive(Default)]
pub struct FailingBackend {
    pub opened: Arc<AtomicBool>,
    pub aborted: Arc<AtomicBool>,
    pub committed: Arc<AtomicBool>,
    pub fail_commit: bool,
    pub fail_open: bool,
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn describe(&self) -> String {
        "failing".to_string()
    }

    async fn open_writer(&self, destination: &Destination) -> Result<Box<dyn ArtifactWriter>> {
        if self.fail_open {
            return Err(Error::storage(
                destination,
                std::io::Error::other("permission denied"),
            ));
        }
        self.opened.store(true, Ordering::SeqCst);
        Ok(Box::new(FailingWriter {
            destination: destination.clone(),
            aborted: Arc::clone(&self.aborted),
            committed: Arc::clone(&self.committed),
            fail_commit: self.fail_commit,
        }))
    }

    async fn exists(&self, _destination: &Destination) -> Result<bool> {
        Ok(self.committed.load(Ordering::SeqCst))
    }
}

struct FailingWriter {
    destination: Destination,
    aborted: Arc<AtomicBool>,
    committed: Arc<AtomicBool>,
    fail_commit: bool,
}

#[async_trait]
impl ArtifactWriter for FailingWriter {
    async fn write(&mut self, _bytes: Bytes) -> Result<()> {
        if self.fail_commit {
            return Ok(());
        }
        Err(Error::storage(
            &self.destination,
            std::io::Error::other("disk full"),
        ))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fail_commit {
            return Err(Error::storage(
                &self.destination,
                std::io::Error::other("rename failed"),
            ));
        }
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Decode a Parquet artifact into record batches.
pub fn read_parquet(data: Bytes) -> Vec<RecordBatch> {
    ParquetRecordBatchReaderBuilder::try_new(data)
        .unwrap()
        .build()
        .unwrap()
        .collect::<std::result::Result<Vec<_>, _>>()
        .unwrap()
}

/// One decoded output row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub labels: Vec<Option<String>>,
    pub bucket_start_ms: i64,
    pub count: u64,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Flatten batches with `label_columns` label columns followed by
/// `_bucket_start, _count, _sum, _min, _max`.
pub fn rows(batches: &[RecordBatch], label_columns: usize) -> Vec<Row> {
    let mut out = Vec::new();
    for batch in batches {
        let starts = batch
            .column(label_columns)
            .as_primitive::<TimestampMillisecondType>();
        let counts = batch
            .column(label_columns + 1)
            .as_primitive::<UInt64Type>();
        let floats: Vec<_> = (label_columns + 2..label_columns + 5)
            .map(|i| batch.column(i).as_primitive::<Float64Type>())
            .collect();
        let opt = |col: usize, row: usize| {
            let array = floats[col];
            (!array.is_null(row)).then(|| array.value(row))
        };

        for row in 0..batch.num_rows() {
            let labels = (0..label_columns)
                .map(|i| {
                    let column = batch.column(i).as_string::<i32>();
                    (!column.is_null(row)).then(|| column.value(row).to_string())
                })
                .collect();
            out.push(Row {
                labels,
                bucket_start_ms: starts.value(row),
                count: counts.value(row),
                sum: opt(0, row),
                min: opt(1, row),
                max: opt(2, row),
            });
        }
    }
    out
}

/// Every regular file under `dir`, recursively.
pub fn files_under(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(files_under(&path));
        } else {
            found.push(path);
        }
    }
    found
}
