//! In-memory series source
//!
//! Serves a fixed collection of series, applying matchers and the time range
//! of each read. Used as the test double for the series seam and, loaded from
//! a JSON dump, as the source for the command-line exporter.

use super::{LabelSet, ReadParams, Sample, Series, SeriesReader, SeriesSet};
use crate::context::ExportContext;
use crate::{Error, Result};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Series source backed by samples held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemorySeriesReader {
    series: Vec<(LabelSet, Vec<Sample>)>,
}

/// JSON representation of one series in a dump file
#[derive(Debug, Deserialize)]
struct SeriesRecord {
    labels: BTreeMap<String, String>,
    samples: Vec<(i64, f64)>,
}

impl InMemorySeriesReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a series; series are served in insertion order.
    pub fn with_series(mut self, labels: LabelSet, samples: Vec<Sample>) -> Self {
        self.series.push((labels, samples));
        self
    }

    pub fn push(&mut self, labels: LabelSet, samples: Vec<Sample>) {
        self.series.push((labels, samples));
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Parse a JSON dump of the form
    /// `[{"labels": {"__name__": "up"}, "samples": [[0, 1.0], [15000, 1.0]]}]`.
    ///
    /// Labels within a series are ordered by name.
    pub fn from_json_slice(data: &[u8]) -> Result<Self> {
        let records: Vec<SeriesRecord> = serde_json::from_slice(data)?;
        let mut reader = Self::new();
        for record in records {
            let labels = LabelSet::from_pairs(record.labels)?;
            let samples = record
                .samples
                .into_iter()
                .map(|(timestamp_ms, value)| Sample::new(timestamp_ms, value))
                .collect();
            reader.push(labels, samples);
        }
        Ok(reader)
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await.map_err(|e| {
            Error::RemoteRead(format!(
                "failed to read series dump {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json_slice(&data)
    }
}

#[async_trait]
impl SeriesReader for InMemorySeriesReader {
    async fn read(&self, ctx: &ExportContext, params: &ReadParams) -> Result<SeriesSet> {
        ctx.check()?;

        let mut set = SeriesSet::new();
        for (labels, samples) in &self.series {
            if !params.matches(labels) {
                continue;
            }
            let in_range: Vec<Sample> = samples
                .iter()
                .copied()
                .filter(|s| params.contains(s.timestamp_ms))
                .collect();
            if in_range.is_empty() {
                continue;
            }
            set.push(Series::from_samples(labels.clone(), in_range));
        }

        debug!(
            matched = set.len(),
            total = self.series.len(),
            "Resolved series from memory"
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::LabelMatcher;
    use futures::StreamExt;

    fn reader() -> InMemorySeriesReader {
        InMemorySeriesReader::new()
            .with_series(
                LabelSet::from_pairs([("__name__", "up"), ("job", "api")]).unwrap(),
                vec![Sample::new(0, 1.0), Sample::new(50, 1.0), Sample::new(100, 0.0)],
            )
            .with_series(
                LabelSet::from_pairs([("__name__", "up"), ("job", "db")]).unwrap(),
                vec![Sample::new(200, 1.0)],
            )
            .with_series(
                LabelSet::from_pairs([("__name__", "down")]).unwrap(),
                vec![Sample::new(10, 1.0)],
            )
    }

    #[tokio::test]
    async fn test_read_filters_by_matchers_and_range() {
        let params = ReadParams::new(vec![LabelMatcher::equal("__name__", "up")], 0, 100).unwrap();
        let set = reader()
            .read(&ExportContext::background(), &params)
            .await
            .unwrap();

        // The db series has no samples in range and is dropped
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].labels.get("job"), Some("api"));

        let mut series = set.into_iter().next().unwrap();
        let mut timestamps = Vec::new();
        while let Some(sample) = series.samples.next().await {
            timestamps.push(sample.unwrap().timestamp_ms);
        }
        assert_eq!(timestamps, vec![0, 50]);
    }

    #[tokio::test]
    async fn test_read_respects_cancellation() {
        let ctx = ExportContext::background();
        ctx.cancellation_token().cancel();
        let params = ReadParams::new(vec![], 0, 1000).unwrap();
        let err = reader().read(&ctx, &params).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_from_json_slice() {
        let json = br#"[
            {"labels": {"job": "api", "__name__": "up"}, "samples": [[0, 1.0], [15000, 0.5]]},
            {"labels": {"__name__": "up"}, "samples": []}
        ]"#;
        let reader = InMemorySeriesReader::from_json_slice(json).unwrap();
        assert_eq!(reader.len(), 2);
        let (labels, samples) = &reader.series[0];
        let names: Vec<&str> = labels.names().collect();
        assert_eq!(names, vec!["__name__", "job"]);
        assert_eq!(samples[1], Sample::new(15000, 0.5));
    }

    #[test]
    fn test_from_json_slice_rejects_garbage() {
        let err = InMemorySeriesReader::from_json_slice(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
