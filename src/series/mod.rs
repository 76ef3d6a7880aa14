//! Labeled sample streams and the series source seam
//!
//! A [`SeriesSet`] is the aggregation engine's only input: an ordered list of
//! series, each a [`LabelSet`] paired with a lazily consumed [`SampleStream`].
//! Where the series come from is hidden behind the [`SeriesReader`] trait.

mod memory;

pub use memory::InMemorySeriesReader;

use crate::context::ExportContext;
use crate::{Error, Result};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Reserved label carrying the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label key-value pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered label mapping identifying one series
///
/// Names are unique within a set. Insertion order is preserved and drives
/// the first-seen ordering of label columns in the exported table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LabelSet {
    labels: Vec<Label>,
}

impl LabelSet {
    /// Build a label set, rejecting duplicate names.
    pub fn new(labels: Vec<Label>) -> Result<Self> {
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].iter().any(|l| l.name == label.name) {
                return Err(Error::DataIntegrity {
                    series: render_labels(&labels),
                    message: format!("duplicate label name '{}'", label.name),
                });
            }
        }
        Ok(Self { labels })
    }

    /// Build a label set from `(name, value)` pairs.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Result<Self>
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Label::new(name, value))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

fn render_labels(labels: &[Label]) -> String {
    let body = labels
        .iter()
        .map(|l| format!("{}={:?}", l.name, l.value))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{}}}", body)
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_labels(&self.labels))
    }
}

/// Sample with timestamp (milliseconds since epoch) and value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// Lazy, single-pass sequence of samples for one series
///
/// Items may fail (e.g. a network read behind the stream); such failures are
/// surfaced as read errors by the aggregator.
pub type SampleStream = BoxStream<'static, Result<Sample>>;

/// One labeled series
pub struct Series {
    pub labels: LabelSet,
    pub samples: SampleStream,
}

impl Series {
    pub fn new(labels: LabelSet, samples: SampleStream) -> Self {
        Self { labels, samples }
    }

    /// Series backed by samples already in memory.
    pub fn from_samples(labels: LabelSet, samples: Vec<Sample>) -> Self {
        Self::new(labels, stream::iter(samples.into_iter().map(Ok)).boxed())
    }
}

impl fmt::Debug for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Series")
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of series covering one read request
pub type SeriesSet = Vec<Series>;

/// Label matcher operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regex => "=~",
            MatchType::NotRegex => "!~",
        }
    }
}

/// Selects series by one label
///
/// An absent label matches as the empty string. Regular expressions are
/// fully anchored.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    name: String,
    match_type: MatchType,
    value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn new(match_type: MatchType, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(Error::Config("label matcher name cannot be empty".to_string()));
        }

        let regex = match match_type {
            MatchType::Regex | MatchType::NotRegex => {
                let anchored = format!("^(?:{})$", value);
                Some(Regex::new(&anchored).map_err(|e| {
                    Error::Config(format!("invalid regex in matcher for '{}': {}", name, e))
                })?)
            }
            MatchType::Equal | MatchType::NotEqual => None,
        };

        Ok(Self {
            name,
            match_type,
            value,
            regex,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            match_type: MatchType::Equal,
            value: value.into(),
            regex: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Test a label value; `None` means the label is absent.
    pub fn matches_value(&self, value: Option<&str>) -> bool {
        let value = value.unwrap_or("");
        match (self.match_type, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(value),
            (MatchType::NotRegex, Some(re)) => !re.is_match(value),
            (MatchType::Regex, None) | (MatchType::NotRegex, None) => false,
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matches_value(labels.get(&self.name))
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type.as_str(), self.value)
    }
}

impl FromStr for LabelMatcher {
    type Err = Error;

    /// Parse `name=value`, `name!=value`, `name=~regex` or `name!~regex`.
    /// The value may be wrapped in double quotes.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (pos, match_type, op_len) = ["!=", "=~", "!~", "="]
            .iter()
            .filter_map(|op| s.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
            .map(|(pos, op)| {
                let match_type = match op {
                    "!=" => MatchType::NotEqual,
                    "=~" => MatchType::Regex,
                    "!~" => MatchType::NotRegex,
                    _ => MatchType::Equal,
                };
                (pos, match_type, op.len())
            })
            .ok_or_else(|| Error::Config(format!("invalid label matcher '{}'", s)))?;

        let name = s[..pos].trim();
        let raw_value = s[pos + op_len..].trim();
        let value = raw_value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(raw_value);

        Self::new(match_type, name, value)
    }
}

/// Parameters of one series read
#[derive(Debug, Clone)]
pub struct ReadParams {
    pub matchers: Vec<LabelMatcher>,
    /// Inclusive lower bound in milliseconds
    pub min_time_ms: i64,
    /// Exclusive upper bound in milliseconds
    pub max_time_ms: i64,
}

impl ReadParams {
    pub fn new(matchers: Vec<LabelMatcher>, min_time_ms: i64, max_time_ms: i64) -> Result<Self> {
        if min_time_ms >= max_time_ms {
            return Err(Error::Config(format!(
                "min time {} must be before max time {}",
                min_time_ms, max_time_ms
            )));
        }
        Ok(Self {
            matchers,
            min_time_ms,
            max_time_ms,
        })
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matchers.iter().all(|m| m.matches(labels))
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.min_time_ms && timestamp_ms < self.max_time_ms
    }
}

/// Series source interface
///
/// Implementations resolve matchers and a time range into a [`SeriesSet`].
/// Failures are reported as [`Error::RemoteRead`]; retrying is the
/// implementation's business, never the caller's.
#[async_trait]
pub trait SeriesReader: Send + Sync {
    async fn read(&self, ctx: &ExportContext, params: &ReadParams) -> Result<SeriesSet>;
}
