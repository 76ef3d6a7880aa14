//! Windowed aggregation of series samples
//!
//! Every series is bucketed independently by a fixed window anchored at its
//! own first sample, and each non-empty bucket yields one
//! [`AggregatedBucket`]. Series may be aggregated concurrently, but output
//! always follows the order of the input [`SeriesSet`].

mod bucket;

pub use bucket::{
    AggregateValue, AggregatedBucket, AggregationResult, SeriesAggregator, TimeBucket,
};

use crate::context::ExportContext;
use crate::series::{Series, SeriesSet};
use crate::{Error, Result, Stage};

use arrow_schema::DataType;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Supported aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationFunction {
    /// Number of samples, finite or not
    Count,
    /// Sum of finite values
    Sum,
    /// Smallest finite value
    Min,
    /// Largest finite value
    Max,
}

impl AggregationFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationFunction::Count => "count",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
        }
    }

    /// Name of the output column holding this function's values
    pub fn column_name(&self) -> &'static str {
        match self {
            AggregationFunction::Count => "_count",
            AggregationFunction::Sum => "_sum",
            AggregationFunction::Min => "_min",
            AggregationFunction::Max => "_max",
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            AggregationFunction::Count => DataType::UInt64,
            AggregationFunction::Sum | AggregationFunction::Min | AggregationFunction::Max => {
                DataType::Float64
            }
        }
    }

    /// Count is defined for every non-empty bucket; the others may be absent.
    pub fn nullable(&self) -> bool {
        !matches!(self, AggregationFunction::Count)
    }
}

impl fmt::Display for AggregationFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationFunction {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(Error::Config(format!(
                "unknown aggregation function '{}'; expected one of count, sum, min, max",
                other
            ))),
        }
    }
}

/// Named switches for the built-in functions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationOptions {
    pub count: bool,
    pub sum: bool,
    pub min: bool,
    pub max: bool,
}

impl AggregationOptions {
    pub fn all() -> Self {
        Self {
            count: true,
            sum: true,
            min: true,
            max: true,
        }
    }

    /// Enabled functions in column order: count, sum, min, max.
    pub fn functions(&self) -> Vec<AggregationFunction> {
        [
            (self.count, AggregationFunction::Count),
            (self.sum, AggregationFunction::Sum),
            (self.min, AggregationFunction::Min),
            (self.max, AggregationFunction::Max),
        ]
        .into_iter()
        .filter_map(|(enabled, function)| enabled.then_some(function))
        .collect()
    }
}

/// What to do when a series' samples go backwards in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IntegrityPolicy {
    /// Fail the whole export
    #[default]
    Abort,
    /// Drop every row of the offending series and keep going
    SkipSeries,
}

impl FromStr for IntegrityPolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" | "skip_series" | "skip-series" => Ok(Self::SkipSeries),
            other => Err(Error::Config(format!(
                "unknown integrity policy '{}'; expected abort or skip",
                other
            ))),
        }
    }
}

/// Validated aggregation configuration
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    window_ms: i64,
    functions: Vec<AggregationFunction>,
    parallelism: usize,
    integrity_policy: IntegrityPolicy,
}

impl AggregationConfig {
    /// Build a configuration from a window and functions in column order.
    ///
    /// The window is truncated to whole milliseconds and must be at least
    /// one; at least one function must be given. Repeated functions are
    /// kept once, at their first position.
    pub fn new(
        window: Duration,
        functions: impl IntoIterator<Item = AggregationFunction>,
    ) -> Result<Self> {
        let window_ms = i64::try_from(window.as_millis())
            .map_err(|_| Error::Config(format!("window {:?} is too large", window)))?;
        if window_ms <= 0 {
            return Err(Error::Config(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }

        let mut unique = Vec::new();
        for function in functions {
            if !unique.contains(&function) {
                unique.push(function);
            }
        }
        if unique.is_empty() {
            return Err(Error::Config(
                "at least one aggregation function must be enabled".to_string(),
            ));
        }

        Ok(Self {
            window_ms,
            functions: unique,
            parallelism: 1,
            integrity_policy: IntegrityPolicy::default(),
        })
    }

    pub fn from_options(window: Duration, options: AggregationOptions) -> Result<Self> {
        Self::new(window, options.functions())
    }

    /// Number of series aggregated concurrently (minimum 1).
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_integrity_policy(mut self, policy: IntegrityPolicy) -> Self {
        self.integrity_policy = policy;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms as u64)
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn functions(&self) -> &[AggregationFunction] {
        &self.functions
    }

    pub fn is_enabled(&self, function: AggregationFunction) -> bool {
        self.functions.contains(&function)
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn integrity_policy(&self) -> IntegrityPolicy {
        self.integrity_policy
    }
}

/// Aggregate every series of `series_set`.
///
/// Each series is consumed by its own tokio task, with at most
/// `config.parallelism()` in flight. Results are merged in series order, so
/// all buckets of series `i` precede those of series `i + 1` and buckets
/// within a series are in ascending time order. The stream ends at the
/// first error.
///
/// Must be polled from within a tokio runtime.
pub fn aggregate(
    series_set: SeriesSet,
    config: &AggregationConfig,
    ctx: &ExportContext,
) -> BoxStream<'static, Result<AggregatedBucket>> {
    let config = config.clone();
    let ctx = ctx.clone();
    let parallelism = config.parallelism();

    stream::iter(series_set.into_iter().enumerate())
        .map(move |(index, series)| {
            let worker = aggregate_series(index, series, config.clone(), ctx.clone());
            tokio::spawn(worker)
        })
        .buffered(parallelism)
        .map(|joined| match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::Internal(format!("aggregation worker failed: {}", e))
                .in_stage(Stage::Aggregate)),
        })
        .flat_map(|outcome| match outcome {
            Ok(buckets) => stream::iter(buckets.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::once(future::ready(Err(e))).right_stream(),
        })
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

/// Consume one series and return its buckets.
///
/// A skipped series yields no buckets at all.
async fn aggregate_series(
    index: usize,
    series: Series,
    config: AggregationConfig,
    ctx: ExportContext,
) -> Result<Vec<AggregatedBucket>> {
    let Series {
        labels,
        mut samples,
    } = series;
    let mut aggregator = SeriesAggregator::new(Arc::new(labels), &config);
    let mut buckets = Vec::new();
    let mut sample_count = 0usize;

    loop {
        let next = ctx
            .guard(samples.next())
            .await
            .map_err(|e| e.in_stage(Stage::Read))?;
        let Some(sample) = next else {
            break;
        };
        let sample = sample.map_err(|e| e.in_stage(Stage::Read))?;
        sample_count += 1;

        match aggregator.push(sample) {
            Ok(Some(bucket)) => buckets.push(bucket),
            Ok(None) => {}
            Err(e) => match config.integrity_policy() {
                IntegrityPolicy::Abort => return Err(e.in_stage(Stage::Aggregate)),
                IntegrityPolicy::SkipSeries => {
                    warn!(
                        series_index = index,
                        series = %aggregator.labels(),
                        error = %e,
                        "Skipping series with out-of-order samples"
                    );
                    return Ok(Vec::new());
                }
            },
        }
    }
    buckets.extend(aggregator.finish());

    debug!(
        series_index = index,
        samples = sample_count,
        buckets = buckets.len(),
        "Aggregated series"
    );
    Ok(buckets)
}
