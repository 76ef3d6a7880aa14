//! Component factory for environment-based configuration
//!
//! Builds the storage backend from environment variables so the binary can
//! switch between local and S3 storage without code changes.

use crate::storage::{FilesystemBackend, ObjectStoreBackend, StorageBackend};
use crate::{Error, Result, StorageConfig, StorageProvider};
use object_store::{aws::AmazonS3Builder, memory::InMemory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

impl StorageConfig {
    /// Load storage configuration from the process environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "filesystem" (default), "s3" or "memory"
    /// - STORAGE_DIR: root directory for filesystem (default: current directory)
    /// - STORAGE_PREFIX: key prefix for object stores (optional)
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`StorageConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let provider = match var("STORAGE_BACKEND") {
            Some(raw) => raw.parse::<StorageProvider>()?,
            None => StorageProvider::Filesystem,
        };
        let directory = match var("STORAGE_DIR") {
            Some(dir) => Some(PathBuf::from(dir)),
            None if provider == StorageProvider::Filesystem => Some(PathBuf::from(".")),
            None => None,
        };

        let config = Self {
            provider,
            directory,
            prefix: var("STORAGE_PREFIX"),
            bucket: var("S3_BUCKET"),
            region: var("S3_REGION"),
            endpoint: var("S3_ENDPOINT"),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check provider-specific requirements.
    pub fn validate(&self) -> Result<()> {
        match self.provider {
            StorageProvider::Memory => Ok(()),
            StorageProvider::Filesystem if self.directory.is_none() => Err(Error::Config(
                "STORAGE_DIR required when STORAGE_BACKEND=filesystem".to_string(),
            )),
            StorageProvider::Filesystem => Ok(()),
            StorageProvider::Aws if self.bucket.is_none() => Err(Error::Config(
                "S3_BUCKET required when STORAGE_BACKEND=s3".to_string(),
            )),
            StorageProvider::Aws => Ok(()),
        }
    }

    /// Reject providers whose artifacts do not outlive the process.
    pub fn ensure_durable(&self) -> Result<()> {
        match self.provider {
            StorageProvider::Memory => Err(Error::Config(
                "STORAGE_BACKEND=memory discards the artifact on exit; use filesystem or s3"
                    .to_string(),
            )),
            StorageProvider::Filesystem | StorageProvider::Aws => Ok(()),
        }
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create a storage backend from explicit configuration
    pub fn create_storage_backend(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
        config.validate()?;

        match config.provider {
            StorageProvider::Memory => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(Self::with_prefix(
                    ObjectStoreBackend::new(Arc::new(InMemory::new())),
                    config,
                )))
            }
            StorageProvider::Filesystem => {
                let directory = config.directory.clone().ok_or_else(|| {
                    Error::Config("STORAGE_DIR required when STORAGE_BACKEND=filesystem".to_string())
                })?;
                info!(directory = %directory.display(), "Using filesystem storage");
                Ok(Arc::new(FilesystemBackend::new(directory)))
            }
            StorageProvider::Aws => {
                let bucket = config.bucket.as_deref().ok_or_else(|| {
                    Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = config.region.as_deref().unwrap_or("us-east-1");

                info!(bucket = %bucket, region = %region, "Using S3 object store");

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(region);

                // MinIO, LocalStack
                if let Some(endpoint) = &config.endpoint {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }

                // Explicit credentials if provided, otherwise IAM role
                if let Some(key) = &config.access_key_id {
                    builder = builder.with_access_key_id(key);
                }
                if let Some(secret) = &config.secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }

                let store = builder.build()?;
                Ok(Arc::new(Self::with_prefix(
                    ObjectStoreBackend::new(Arc::new(store)),
                    config,
                )))
            }
        }
    }

    fn with_prefix(backend: ObjectStoreBackend, config: &StorageConfig) -> ObjectStoreBackend {
        match &config.prefix {
            Some(prefix) => backend.with_prefix(prefix.clone()),
            None => backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_to_current_directory() {
        let config = StorageConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.provider, StorageProvider::Filesystem);
        assert_eq!(config.directory, Some(PathBuf::from(".")));
        assert!(config.ensure_durable().is_ok());
        assert!(ComponentFactory::create_storage_backend(&config).is_ok());
    }

    #[test]
    fn test_memory_is_not_durable() {
        let config = StorageConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "memory")])).unwrap();
        assert_eq!(config.provider, StorageProvider::Memory);
        assert_eq!(config.directory, None);
        let err = config.ensure_durable().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(format!("{err}").contains("memory"));
    }

    #[test]
    fn test_filesystem_requires_directory() {
        let config = StorageConfig {
            provider: StorageProvider::Filesystem,
            ..Default::default()
        };
        assert!(matches!(config.validate().unwrap_err(), Error::Config(_)));

        let config = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "filesystem"),
            ("STORAGE_DIR", "/tmp/exports"),
        ]))
        .unwrap();
        let backend = ComponentFactory::create_storage_backend(&config).unwrap();
        assert!(backend.describe().contains("/tmp/exports"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let err = StorageConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "s3")])).unwrap_err();
        assert!(format!("{err}").contains("S3_BUCKET"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = StorageConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "ftp")])).unwrap_err();
        assert!(format!("{err}").contains("unknown storage backend"));
    }

    #[test]
    fn test_memory_prefix_applied() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "memory"),
            ("STORAGE_PREFIX", "exports"),
        ]))
        .unwrap();
        let backend = ComponentFactory::create_storage_backend(&config).unwrap();
        assert!(backend.describe().contains("prefix=exports"));
    }
}
