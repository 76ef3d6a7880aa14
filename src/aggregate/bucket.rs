//! Per-series bucketing state machine

use super::{AggregationConfig, AggregationFunction};
use crate::series::{LabelSet, Sample};
use crate::{Error, Result};

use std::sync::Arc;

/// Half-open interval `[start_ms, start_ms + width_ms)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket {
    pub start_ms: i64,
    pub width_ms: i64,
}

impl TimeBucket {
    pub fn end_ms(&self) -> i64 {
        self.start_ms.saturating_add(self.width_ms)
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms()
    }
}

/// Computed value of one aggregation function
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateValue {
    Count(u64),
    Float(f64),
}

/// Aggregates of one bucket of one series
///
/// A function's value is present only if the function is enabled and the
/// bucket holds a sample it can use: count always has one, sum/min/max need
/// at least one finite value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregationResult {
    pub count: Option<u64>,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AggregationResult {
    pub fn get(&self, function: AggregationFunction) -> Option<AggregateValue> {
        match function {
            AggregationFunction::Count => self.count.map(AggregateValue::Count),
            AggregationFunction::Sum => self.sum.map(AggregateValue::Float),
            AggregationFunction::Min => self.min.map(AggregateValue::Float),
            AggregationFunction::Max => self.max.map(AggregateValue::Float),
        }
    }
}

/// One aggregator output item
#[derive(Debug, Clone)]
pub struct AggregatedBucket {
    pub labels: Arc<LabelSet>,
    pub bucket: TimeBucket,
    pub result: AggregationResult,
}

/// Running totals for the bucket currently being filled
///
/// Values are folded in sample order with plain `f64` arithmetic.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    index: i64,
    count: u64,
    finite: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new(index: i64) -> Self {
        Self {
            index,
            count: 0,
            finite: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        if value.is_finite() {
            self.finite += 1;
            self.sum += value;
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }

    fn result(&self, functions: &[AggregationFunction]) -> AggregationResult {
        let mut result = AggregationResult::default();
        let has_finite = self.finite > 0;
        for function in functions {
            match function {
                AggregationFunction::Count => result.count = Some(self.count),
                AggregationFunction::Sum if has_finite => result.sum = Some(self.sum),
                AggregationFunction::Min if has_finite => result.min = Some(self.min),
                AggregationFunction::Max if has_finite => result.max = Some(self.max),
                _ => {}
            }
        }
        result
    }
}

/// Buckets the samples of a single series
///
/// The first bucket is anchored at the series' first sample; each sample
/// lands in bucket `(t - t0) / window`. A bucket is emitted as soon as a
/// sample for a later bucket arrives, so only one accumulator is live.
#[derive(Debug)]
pub struct SeriesAggregator {
    labels: Arc<LabelSet>,
    functions: Vec<AggregationFunction>,
    window_ms: i64,
    first_ms: Option<i64>,
    last_ms: i64,
    current: Option<Accumulator>,
}

impl SeriesAggregator {
    pub fn new(labels: Arc<LabelSet>, config: &AggregationConfig) -> Self {
        Self {
            labels,
            functions: config.functions().to_vec(),
            window_ms: config.window_ms(),
            first_ms: None,
            last_ms: i64::MIN,
            current: None,
        }
    }

    pub fn labels(&self) -> &Arc<LabelSet> {
        &self.labels
    }

    /// Feed the next sample; returns the previous bucket if this sample
    /// closed it.
    pub fn push(&mut self, sample: Sample) -> Result<Option<AggregatedBucket>> {
        if sample.timestamp_ms < self.last_ms {
            return Err(Error::DataIntegrity {
                series: self.labels.to_string(),
                message: format!(
                    "sample timestamp {} precedes previous timestamp {}",
                    sample.timestamp_ms, self.last_ms
                ),
            });
        }
        self.last_ms = sample.timestamp_ms;

        let first = *self.first_ms.get_or_insert(sample.timestamp_ms);
        let index = sample
            .timestamp_ms
            .checked_sub(first)
            .map(|offset| offset / self.window_ms)
            .ok_or_else(|| self.overflow(sample.timestamp_ms, first))?;

        let mut flushed = None;
        match self.current.as_mut() {
            Some(acc) if acc.index == index => acc.add(sample.value),
            _ => {
                // Both bounds of the bucket must be representable
                bucket_start(first, index, self.window_ms)
                    .ok_or_else(|| self.overflow(sample.timestamp_ms, first))?;
                let mut acc = Accumulator::new(index);
                acc.add(sample.value);
                if let Some(previous) = self.current.replace(acc) {
                    flushed = Some(self.emit(&previous));
                }
            }
        }
        Ok(flushed)
    }

    /// Flush the last open bucket, if any.
    pub fn finish(&mut self) -> Option<AggregatedBucket> {
        self.current.take().map(|acc| self.emit(&acc))
    }

    fn overflow(&self, timestamp_ms: i64, first_ms: i64) -> Error {
        Error::DataIntegrity {
            series: self.labels.to_string(),
            message: format!(
                "sample timestamp {} is out of bucket range from first timestamp {}",
                timestamp_ms, first_ms
            ),
        }
    }

    fn emit(&self, acc: &Accumulator) -> AggregatedBucket {
        let first = self.first_ms.unwrap_or_default();
        AggregatedBucket {
            labels: Arc::clone(&self.labels),
            bucket: TimeBucket {
                // Checked in push before the accumulator was opened
                start_ms: bucket_start(first, acc.index, self.window_ms).unwrap_or(i64::MAX),
                width_ms: self.window_ms,
            },
            result: acc.result(&self.functions),
        }
    }
}

fn bucket_start(first_ms: i64, index: i64, window_ms: i64) -> Option<i64> {
    index
        .checked_mul(window_ms)
        .and_then(|offset| first_ms.checked_add(offset))
}
