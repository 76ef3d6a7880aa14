//! Local filesystem artifacts
//!
//! Bytes go to a hidden temporary file next to the destination; commit syncs
//! it and renames it into place, which is atomic within one filesystem.
//! Abort, or a failed commit, removes the temporary file.

use super::{ArtifactWriter, Destination, StorageBackend};
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Storage backend rooted at a local directory
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `destination` under the root
    pub fn path_for(&self, destination: &Destination) -> PathBuf {
        let mut path = self.root.clone();
        for segment in destination.segments() {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn describe(&self) -> String {
        format!("filesystem({})", self.root.display())
    }

    async fn open_writer(&self, destination: &Destination) -> Result<Box<dyn ArtifactWriter>> {
        let final_path = self.path_for(destination);
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::storage(destination, e))?;

        let temp_path = parent.join(format!(
            ".{}.{}.tmp",
            destination.file_name(),
            uuid::Uuid::new_v4()
        ));
        let file = File::create(&temp_path)
            .await
            .map_err(|e| Error::storage(destination, e))?;
        debug!(temp = %temp_path.display(), "Opened temporary artifact");

        Ok(Box::new(FilesystemWriter {
            destination: destination.clone(),
            file: Some(file),
            temp_path,
            final_path,
        }))
    }

    async fn exists(&self, destination: &Destination) -> Result<bool> {
        fs::try_exists(self.path_for(destination))
            .await
            .map_err(|e| Error::storage(destination, e))
    }
}

struct FilesystemWriter {
    destination: Destination,
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl FilesystemWriter {
    async fn finalize(&mut self) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.temp_path, &self.final_path).await
    }

    async fn remove_temp(&mut self) -> std::io::Result<()> {
        self.file.take();
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ArtifactWriter for FilesystemWriter {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            Error::storage(
                &self.destination,
                Error::Internal("artifact writer is closed".to_string()),
            )
        })?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::storage(&self.destination, e))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Err(e) = self.finalize().await {
            if let Err(cleanup) = self.remove_temp().await {
                warn!(
                    temp = %self.temp_path.display(),
                    error = %cleanup,
                    "Failed to remove temporary artifact after failed commit"
                );
            }
            return Err(Error::storage(&self.destination, e));
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.remove_temp()
            .await
            .map_err(|e| Error::storage(&self.destination, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut read = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = read.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_commit_renames_into_place() {
        let dir = tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let dest = Destination::new("nested/out.parquet").unwrap();

        let mut writer = backend.open_writer(&dest).await.unwrap();
        writer.write(Bytes::from_static(b"abc")).await.unwrap();
        assert!(!backend.exists(&dest).await.unwrap());
        assert_eq!(entries(&dir.path().join("nested")).await.len(), 1);

        writer.commit().await.unwrap();
        assert!(backend.exists(&dest).await.unwrap());
        assert_eq!(entries(&dir.path().join("nested")).await, vec!["out.parquet"]);
        let data = fs::read(backend.path_for(&dest)).await.unwrap();
        assert_eq!(data, b"abc");
    }

    #[tokio::test]
    async fn test_abort_removes_temp_file() {
        let dir = tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let dest = Destination::new("out.parquet").unwrap();

        let mut writer = backend.open_writer(&dest).await.unwrap();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await.unwrap();

        assert!(!backend.exists(&dest).await.unwrap());
        assert!(entries(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_replaces_existing_artifact() {
        let dir = tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let dest = Destination::new("out.parquet").unwrap();

        for payload in [&b"first"[..], &b"second"[..]] {
            let mut writer = backend.open_writer(&dest).await.unwrap();
            writer.write(Bytes::copy_from_slice(payload)).await.unwrap();
            writer.commit().await.unwrap();
        }
        let data = fs::read(backend.path_for(&dest)).await.unwrap();
        assert_eq!(data, b"second");
    }
}
