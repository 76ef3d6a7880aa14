//! Storage backend seam
//!
//! A backend hands out [`ArtifactWriter`]s for logical destinations. A writer
//! accepts bytes in order and then either commits, making the artifact
//! visible at its destination in one step, or aborts, leaving nothing
//! readable behind. The exporter never branches on the concrete backend.

mod filesystem;
mod object;

pub use filesystem::FilesystemBackend;
pub use object::ObjectStoreBackend;

use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Logical destination of an artifact, e.g. `exports/2024-01-01.parquet`
///
/// Keys are `/`-separated and relative; empty segments, `.` and `..` are
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let trimmed = key.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(Error::Config("destination cannot be empty".to_string()));
        }
        if trimmed
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(Error::Config(format!("invalid destination '{}'", key)));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the key
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Last segment of the key
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Storage backend interface
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable backend description for logs
    fn describe(&self) -> String;

    /// Start writing an artifact for `destination`. Nothing becomes visible
    /// at the destination until the writer commits.
    async fn open_writer(&self, destination: &Destination) -> Result<Box<dyn ArtifactWriter>>;

    /// Whether a committed artifact exists at `destination`.
    async fn exists(&self, destination: &Destination) -> Result<bool>;
}

/// In-progress artifact
#[async_trait]
pub trait ArtifactWriter: Send {
    /// Append bytes to the artifact.
    async fn write(&mut self, bytes: Bytes) -> Result<()>;

    /// Make the artifact durably visible at its destination. On failure
    /// everything staged so far is discarded.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard the artifact; nothing readable remains at the destination.
    async fn abort(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_validation() {
        assert!(Destination::new("").is_err());
        assert!(Destination::new("/").is_err());
        assert!(Destination::new("a//b").is_err());
        assert!(Destination::new("a/../b").is_err());
        assert!(Destination::new("./a").is_err());

        let dest = Destination::new("/exports/day=01/out.parquet").unwrap();
        assert_eq!(dest.as_str(), "exports/day=01/out.parquet");
        assert_eq!(dest.file_name(), "out.parquet");
        assert_eq!(dest.segments().count(), 3);
    }
}
