//! Object-store backed artifacts
//!
//! Works with any [`ObjectStore`]: in-memory, local filesystem, S3. Artifacts
//! are written as multipart uploads, which the store only publishes on
//! completion. Aborting the upload discards every part, so a failed export
//! never leaves a readable object behind. The writer keeps the upload handle
//! until completion succeeds, and a failed commit aborts it as well.

use super::{ArtifactWriter, Destination, StorageBackend};
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default multipart chunk size (S3's minimum part size)
const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;
/// Default number of parts uploading concurrently
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Storage backend over an [`ObjectStore`]
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    chunk_size: usize,
    max_concurrency: usize,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Place every destination under `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Object path for `destination`
    pub fn location(&self, destination: &Destination) -> Result<Path> {
        let key = match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, destination),
            None => destination.to_string(),
        };
        Path::parse(key).map_err(|e| Error::storage(destination, e))
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn describe(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("object_store({}, prefix={})", self.store, prefix),
            None => format!("object_store({})", self.store),
        }
    }

    async fn open_writer(&self, destination: &Destination) -> Result<Box<dyn ArtifactWriter>> {
        let location = self.location(destination)?;
        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(|e| Error::storage(destination, e))?;
        debug!(location = %location, "Opened multipart upload");

        Ok(Box::new(ObjectStoreWriter::new(
            destination.clone(),
            upload,
            self.chunk_size,
            self.max_concurrency,
        )))
    }

    async fn exists(&self, destination: &Destination) -> Result<bool> {
        let location = self.location(destination)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Error::storage(destination, e)),
        }
    }
}

/// Splits the artifact into `chunk_size` parts and uploads up to
/// `max_concurrency` of them at once.
struct ObjectStoreWriter {
    destination: Destination,
    upload: Box<dyn MultipartUpload>,
    buffer: Vec<Bytes>,
    buffered: usize,
    chunk_size: usize,
    max_concurrency: usize,
    parts: JoinSet<object_store::Result<()>>,
}

impl ObjectStoreWriter {
    fn new(
        destination: Destination,
        upload: Box<dyn MultipartUpload>,
        chunk_size: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            destination,
            upload,
            buffer: Vec::new(),
            buffered: 0,
            chunk_size: chunk_size.max(1),
            max_concurrency: max_concurrency.max(1),
            parts: JoinSet::new(),
        }
    }

    fn put_part(&mut self) {
        let payload: PutPayload = std::mem::take(&mut self.buffer).into_iter().collect();
        self.buffered = 0;
        self.parts.spawn(self.upload.put_part(payload));
    }

    /// Wait until at most `max` part uploads are in flight.
    async fn wait_for_capacity(&mut self, max: usize) -> Result<()> {
        while self.parts.len() > max {
            match self.parts.join_next().await {
                Some(Ok(uploaded)) => {
                    uploaded.map_err(|e| Error::storage(&self.destination, e))?
                }
                Some(Err(e)) => {
                    return Err(Error::storage(
                        &self.destination,
                        Error::Internal(format!("part upload task failed: {e}")),
                    ))
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        if self.buffered > 0 {
            self.put_part();
        }
        self.wait_for_capacity(0).await?;
        self.upload
            .complete()
            .await
            .map_err(|e| Error::storage(&self.destination, e))?;
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        self.parts.shutdown().await;
        self.upload
            .abort()
            .await
            .map_err(|e| Error::storage(&self.destination, e))
    }
}

#[async_trait]
impl ArtifactWriter for ObjectStoreWriter {
    async fn write(&mut self, mut bytes: Bytes) -> Result<()> {
        while !bytes.is_empty() {
            let room = self.chunk_size - self.buffered;
            let chunk = bytes.split_to(room.min(bytes.len()));
            self.buffered += chunk.len();
            self.buffer.push(chunk);

            if self.buffered == self.chunk_size {
                self.wait_for_capacity(self.max_concurrency - 1).await?;
                self.put_part();
            }
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Err(e) = self.complete().await {
            if let Err(abort_err) = self.discard().await {
                warn!(
                    destination = %self.destination,
                    error = %abort_err,
                    "Failed to abort multipart upload after failed commit"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.discard().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::{PutResult, UploadPart};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_commit_publishes_object() {
        let store = Arc::new(InMemory::new());
        let backend = ObjectStoreBackend::new(store.clone()).with_prefix("/exports/");
        let dest = Destination::new("a/out.parquet").unwrap();

        let mut writer = backend.open_writer(&dest).await.unwrap();
        writer.write(Bytes::from_static(b"hello ")).await.unwrap();
        writer.write(Bytes::from_static(b"world")).await.unwrap();
        assert!(!backend.exists(&dest).await.unwrap());
        writer.commit().await.unwrap();

        assert!(backend.exists(&dest).await.unwrap());
        let data = store
            .get(&Path::from("exports/a/out.parquet"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing() {
        let store = Arc::new(InMemory::new());
        let backend = ObjectStoreBackend::new(store.clone()).with_chunk_size(4);
        let dest = Destination::new("out.parquet").unwrap();

        let mut writer = backend.open_writer(&dest).await.unwrap();
        writer.write(Bytes::from_static(b"partial data")).await.unwrap();
        writer.abort().await.unwrap();

        assert!(!backend.exists(&dest).await.unwrap());
    }

    /// Upload whose parts always fail
    #[derive(Debug, Default)]
    struct RejectingUpload {
        parts: Arc<AtomicUsize>,
        aborted: Arc<AtomicBool>,
        completed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MultipartUpload for RejectingUpload {
        fn put_part(&mut self, _data: PutPayload) -> UploadPart {
            self.parts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(object_store::Error::Generic {
                    store: "test",
                    source: "part rejected".into(),
                })
            })
        }

        async fn complete(&mut self) -> object_store::Result<PutResult> {
            self.completed.store(true, Ordering::SeqCst);
            Ok(PutResult {
                e_tag: None,
                version: None,
            })
        }

        async fn abort(&mut self) -> object_store::Result<()> {
            self.aborted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_commit_aborts_upload() {
        let upload = RejectingUpload::default();
        let (parts, aborted, completed) = (
            upload.parts.clone(),
            upload.aborted.clone(),
            upload.completed.clone(),
        );
        let dest = Destination::new("out.parquet").unwrap();
        let mut writer = Box::new(ObjectStoreWriter::new(dest, Box::new(upload), 1024, 4));

        // Below one chunk, so the only part is uploaded during commit
        writer.write(Bytes::from_static(b"tail")).await.unwrap();
        assert_eq!(parts.load(Ordering::SeqCst), 0);

        let err = writer.commit().await.unwrap_err();
        assert!(err.to_string().contains("out.parquet"));
        assert!(matches!(err.root(), Error::ObjectStore(_)));
        assert_eq!(parts.load(Ordering::SeqCst), 1);
        assert!(aborted.load(Ordering::SeqCst));
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_writes_split_into_chunk_sized_parts() {
        let store = Arc::new(InMemory::new());
        let backend = ObjectStoreBackend::new(store.clone())
            .with_chunk_size(3)
            .with_max_concurrency(1);
        let dest = Destination::new("chunks.parquet").unwrap();

        let mut writer = backend.open_writer(&dest).await.unwrap();
        for piece in [&b"ab"[..], b"cdefg", b"", b"h"] {
            writer.write(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        writer.commit().await.unwrap();

        let data = store
            .get(&Path::from("chunks.parquet"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&data[..], b"abcdefgh");
    }

    #[test]
    fn test_describe_mentions_prefix() {
        let backend = ObjectStoreBackend::new(Arc::new(InMemory::new())).with_prefix("team");
        assert!(backend.describe().contains("prefix=team"));
    }
}
