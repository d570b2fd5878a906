//! Upload destination for finished artifacts.
//!
//! [`BucketStore`] adapts any `object_store` backend: S3-compatible services
//! (Aliyun OSS, MinIO, AWS) in production, a local directory for `file://`
//! endpoints, and the in-memory store in tests.

use crate::config::OssSettings;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// Multipart part size for streamed uploads (8MB)
const UPLOAD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

const FILE_SCHEME: &str = "file://";

/// Capability that moves a local file to a remote key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `local` to `key`, returning the number of bytes sent.
    async fn upload(&self, local: &Path, key: &str) -> Result<u64>;

    /// Human-readable destination for log lines.
    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct BucketStore {
    inner: Arc<dyn object_store::ObjectStore>,
    label: String,
}

impl BucketStore {
    /// Wrap an already-built backend.
    pub fn new(inner: Arc<dyn object_store::ObjectStore>, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
        }
    }

    /// Build the backend named by `settings.endpoint`.
    pub fn from_settings(settings: &OssSettings) -> Result<Self> {
        if let Some(root) = settings.endpoint.strip_prefix(FILE_SCHEME) {
            return Self::local(Path::new(root).join(&settings.bucket));
        }

        let (scheme, host) = split_endpoint(&settings.endpoint);
        let endpoint = if settings.path_style {
            format!("{}://{}", scheme, host)
        } else {
            // Virtual-hosted requests expect the bucket in the endpoint host
            format!("{}://{}.{}", scheme, settings.bucket, host)
        };

        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint.clone())
            .with_allow_http(scheme == "http")
            .with_region(settings.region.clone())
            .with_bucket_name(settings.bucket.clone())
            .with_access_key_id(settings.access_key.clone())
            .with_secret_access_key(settings.secret_key.clone())
            .with_virtual_hosted_style_request(!settings.path_style)
            .build()
            .map_err(|e| BackupError::Config(format!("invalid object storage settings: {}", e)))?;

        Ok(Self::new(
            Arc::new(store),
            format!("{} (bucket {})", endpoint, settings.bucket),
        ))
    }

    /// Directory-backed store; `root` is created if missing.
    pub fn local(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(|e| {
            BackupError::Config(format!("cannot create local bucket {}: {}", root.display(), e))
        })?;
        let store = LocalFileSystem::new_with_prefix(&root).map_err(|e| {
            BackupError::Config(format!("invalid local bucket {}: {}", root.display(), e))
        })?;
        Ok(Self::new(Arc::new(store), format!("{}{}", FILE_SCHEME, root.display())))
    }
}

#[async_trait]
impl ObjectStore for BucketStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<u64> {
        let location = object_store::path::Path::parse(key)
            .map_err(|e| BackupError::upload(format!("invalid object key {}", key), e))?;
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| BackupError::upload(format!("opening {}", local.display()), e))?;

        let start = Instant::now();
        let mut writer = BufWriter::with_capacity(self.inner.clone(), location, UPLOAD_CHUNK_SIZE);

        let sent = match tokio::io::copy(&mut file, &mut writer).await {
            Ok(n) => writer.shutdown().await.map(|_| n),
            Err(e) => Err(e),
        };

        match sent {
            Ok(size) => {
                info!(
                    key = %key,
                    size_bytes = size,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Upload successful"
                );
                Ok(size)
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(key = %key, error = %abort_err, "Failed to abort partial upload");
                }
                error!(
                    key = %key,
                    error = %e,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Upload failed"
                );
                Err(BackupError::upload(
                    format!("uploading {} to {}", local.display(), key),
                    e,
                ))
            }
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// `https://oss-cn-hangzhou.aliyuncs.com/` -> (`https`, `oss-cn-hangzhou.aliyuncs.com`).
/// A bare host defaults to https.
fn split_endpoint(endpoint: &str) -> (&str, &str) {
    let endpoint = endpoint.trim().trim_end_matches('/');
    match endpoint.split_once("://") {
        Some((scheme, host)) => (scheme, host),
        None => ("https", endpoint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::ObjectStoreExt;
    use tempfile::TempDir;

    fn settings(endpoint: &str, path_style: bool) -> OssSettings {
        OssSettings {
            endpoint: endpoint.to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            bucket: "bucket".to_string(),
            prefix: String::new(),
            region: "us-east-1".to_string(),
            path_style,
        }
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("oss-cn-hangzhou.aliyuncs.com"), ("https", "oss-cn-hangzhou.aliyuncs.com"));
        assert_eq!(split_endpoint("http://minio:9000/"), ("http", "minio:9000"));
    }

    #[test]
    fn test_virtual_hosted_endpoint_includes_bucket() {
        let store = BucketStore::from_settings(&settings("oss-cn-hangzhou.aliyuncs.com", false)).unwrap();
        assert!(store.describe().starts_with("https://bucket.oss-cn-hangzhou.aliyuncs.com"));

        let store = BucketStore::from_settings(&settings("http://minio:9000", true)).unwrap();
        assert!(store.describe().starts_with("http://minio:9000"));
    }

    #[tokio::test]
    async fn test_upload_streams_file_contents() {
        let memory = Arc::new(InMemory::new());
        let store = BucketStore::new(memory.clone(), "memory");
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("artifact.zst");
        let payload = vec![42u8; 3 * 1024 * 1024];
        std::fs::write(&local, &payload).unwrap();

        let sent = store.upload(&local, "p/20240305/artifact.zst").await.unwrap();
        assert_eq!(sent, payload.len() as u64);

        let stored = memory
            .get(&object_store::path::Path::from("p/20240305/artifact.zst"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_missing_local_file_is_upload_error() {
        let store = BucketStore::new(Arc::new(InMemory::new()), "memory");
        let err = store
            .upload(Path::new("/no/such/artifact"), "k")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Upload { .. }));
    }

    #[tokio::test]
    async fn test_file_endpoint_writes_to_directory() {
        let dir = TempDir::new().unwrap();
        let endpoint = format!("file://{}", dir.path().display());
        let store = BucketStore::from_settings(&settings(&endpoint, false)).unwrap();

        let local = dir.path().join("x.txt");
        std::fs::write(&local, b"hello").unwrap();
        store.upload(&local, "20240305/x.txt").await.unwrap();

        let landed = dir.path().join("bucket/20240305/x.txt");
        assert_eq!(std::fs::read(landed).unwrap(), b"hello");
    }
}
