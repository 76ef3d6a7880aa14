//! Error types for obsframe

use std::fmt;

/// Result type alias for obsframe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Fetching series or consuming samples
    Read,
    /// Bucketing samples and computing aggregates
    Aggregate,
    /// Schema discovery and row assembly
    Build,
    /// Columnar encoding
    Encode,
    /// Writing to or committing on the storage backend
    Upload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Read => "read",
            Stage::Aggregate => "aggregate",
            Stage::Build => "build",
            Stage::Encode => "encode",
            Stage::Upload => "upload",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for obsframe
#[derive(Debug)]
pub enum Error {
    /// Arrow-related errors
    Arrow(arrow::error::ArrowError),
    /// Parquet-related errors
    Parquet(parquet::errors::ParquetError),
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Invalid configuration, raised before any I/O
    Config(String),
    /// The series source failed (network, timeout, query error)
    RemoteRead(String),
    /// A sample stream violated its ordering or label invariants
    DataIntegrity { series: String, message: String },
    /// Table schema could not be derived or a row does not fit it
    Schema(String),
    /// Encoder contract violation
    Encoding(String),
    /// Storage backend failure for a destination
    Storage { destination: String, source: Box<Error> },
    /// The export context was cancelled
    Cancelled,
    /// The export context deadline elapsed
    DeadlineExceeded,
    /// Internal error
    Internal(String),
    /// Error attributed to a pipeline stage
    Stage { stage: Stage, source: Box<Error> },
}

impl Error {
    /// Attribute this error to `stage`, unless it already carries one.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Wrap a backend error with the destination it concerns.
    pub fn storage(destination: impl fmt::Display, source: impl Into<Error>) -> Self {
        Error::Storage {
            destination: destination.to_string(),
            source: Box::new(source.into()),
        }
    }

    /// The stage this error was attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The innermost error, skipping stage and storage wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } | Error::Storage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the error stems from cancellation or an elapsed deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), Error::Cancelled | Error::DeadlineExceeded)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Arrow(e) => Some(e),
            Error::Parquet(e) => Some(e),
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Storage { source, .. } | Error::Stage { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Parquet(e) => write!(f, "Parquet error: {}", e),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::RemoteRead(msg) => write!(f, "Remote read error: {}", msg),
            Error::DataIntegrity { series, message } => {
                write!(f, "Data integrity error in series {}: {}", series, message)
            }
            Error::Schema(msg) => write!(f, "Schema error: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::Storage {
                destination,
                source,
            } => write!(f, "Storage error at {}: {}", destination, source),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::DeadlineExceeded => write!(f, "Deadline exceeded"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::Stage { stage, source } => write!(f, "{} stage failed: {}", stage, source),
        }
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Parquet(e)
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<object_store::path::Error> for Error {
    fn from(e: object_store::path::Error) -> Self {
        Error::ObjectStore(e.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
