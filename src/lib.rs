//! # obsframe
//!
//! Exports time-series data into aggregated columnar files.
//!
//! Series matched by label matchers over a time range are read from a
//! [`SeriesReader`](series::SeriesReader), cut into fixed-width time buckets
//! per series, reduced with the enabled aggregation functions (count, sum,
//! min, max), laid out as a table with one row per non-empty
//! (series, bucket), encoded as Parquet and committed atomically to a
//! [`StorageBackend`](storage::StorageBackend).
//!
//! ## Pipeline
//!
//! - **Read**: resolve matchers and range into a series set
//! - **Aggregate**: bucket each series' samples, one task per series, merged in series order
//! - **Build**: project buckets onto a schema fixed from the series' label sets
//! - **Encode**: stream rows through Arrow builders into a Parquet writer
//! - **Upload**: stream encoded bytes to the backend; commit on success, abort on any failure

pub mod aggregate;
pub mod config;
pub mod context;
pub mod dataframe;
pub mod encoder;
pub mod exporter;
pub mod pipeline;
pub mod series;
pub mod storage;
pub mod telemetry;

mod error;

pub use error::{Error, Result, Stage};

use std::path::PathBuf;

/// Storage backend configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    /// Root directory for the filesystem provider
    pub directory: Option<PathBuf>,
    /// Key prefix applied to every destination (object store providers)
    pub prefix: Option<String>,
    /// Bucket name for the S3 provider
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// Custom S3 endpoint (MinIO, LocalStack)
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Supported storage providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageProvider {
    Memory,
    #[default]
    Filesystem,
    Aws,
}

impl StorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Filesystem => "filesystem",
            Self::Aws => "s3",
        }
    }
}

impl std::str::FromStr for StorageProvider {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "filesystem" | "fs" | "local" => Ok(Self::Filesystem),
            "s3" | "aws" => Ok(Self::Aws),
            other => Err(Error::Config(format!(
                "unknown storage backend '{}'; expected one of memory, filesystem, s3",
                other
            ))),
        }
    }
}

/// Re-exports for convenience
pub mod prelude {
    pub use crate::aggregate::{
        AggregationConfig, AggregationFunction, AggregationOptions, IntegrityPolicy,
    };
    pub use crate::context::ExportContext;
    pub use crate::dataframe::{DataFrameBuilder, DataFrameRow, DataFrameSchema};
    pub use crate::encoder::{Encoder, EncoderWriter, ParquetEncoder};
    pub use crate::exporter::{ExportSummary, Exporter};
    pub use crate::pipeline::{ExportRequest, Pipeline};
    pub use crate::series::{
        InMemorySeriesReader, LabelMatcher, LabelSet, ReadParams, Sample, Series, SeriesReader,
        SeriesSet,
    };
    pub use crate::storage::{
        ArtifactWriter, Destination, FilesystemBackend, ObjectStoreBackend, StorageBackend,
    };
    pub use crate::{Error, Result, Stage, StorageConfig, StorageProvider};
}
