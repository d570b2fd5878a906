//! Point-in-time snapshots of remote systems.
//!
//! A [`SnapshotSource`] only produces bytes. Landing them on disk, checking
//! them and promoting them out of the `.unverified` name is done here so every
//! source gets the same treatment.

pub mod consul;
pub mod etcd;

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub use consul::ConsulSource;
pub use etcd::EtcdSource;

/// Bytes read back during the readability check
pub const HEAD_LEN: usize = 1024;

pub const UNVERIFIED_SUFFIX: &str = ".unverified";

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Etcd,
    Consul,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Etcd => f.write_str("etcd"),
            SourceKind::Consul => f.write_str("consul"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Opaque index/version reported by the source. Only logged.
    pub position: Option<String>,
}

pub struct Snapshot {
    pub stream: ByteStream,
    pub meta: SnapshotMeta,
}

/// Structural check over a staged snapshot file; returns a short summary.
pub type Inspector = fn(&Path) -> Result<String>;

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Name component for the artifact, e.g. `etcd-snapshot.db`.
    fn artifact_token(&self) -> &'static str;

    /// Open the snapshot stream.
    async fn acquire(&self) -> Result<Snapshot>;

    /// Format-specific check run after the readability check.
    fn inspector(&self) -> Option<Inspector> {
        None
    }

    /// Upper bound for acquiring and staging the snapshot.
    fn deadline(&self) -> Option<Duration> {
        None
    }
}

/// `<path>.unverified`
pub fn unverified_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(UNVERIFIED_SUFFIX);
    PathBuf::from(name)
}

/// Drain `stream` into `dest`, returning the number of bytes written.
pub async fn write_stream(mut stream: ByteStream, dest: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| BackupError::acquisition(format!("creating {}", dest.display()), e))?;

    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BackupError::acquisition("reading snapshot stream", e))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| BackupError::acquisition(format!("writing {}", dest.display()), e))?;
        written += chunk.len() as u64;
    }

    file.flush()
        .await
        .map_err(|e| BackupError::acquisition(format!("writing {}", dest.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| BackupError::acquisition(format!("syncing {}", dest.display()), e))?;

    debug!(path = %dest.display(), size_bytes = written, "Snapshot staged");
    Ok(written)
}

/// The file must be non-empty and yield its first bytes. Returns its size.
pub async fn verify_readable(path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| BackupError::Verification(format!("cannot open {}: {}", path.display(), e)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| BackupError::Verification(format!("cannot stat {}: {}", path.display(), e)))?
        .len();

    if size == 0 {
        return Err(BackupError::Verification(format!(
            "snapshot {} is empty",
            path.display()
        )));
    }

    let mut head = vec![0u8; HEAD_LEN];
    let read = file
        .read(&mut head)
        .await
        .map_err(|e| BackupError::Verification(format!("cannot read {}: {}", path.display(), e)))?;
    if read == 0 {
        return Err(BackupError::Verification(format!(
            "snapshot {} reports {} bytes but none could be read",
            path.display(),
            size
        )));
    }

    Ok(size)
}

/// Rename a verified snapshot to its final name.
pub async fn promote(unverified: &Path, verified: &Path) -> Result<()> {
    tokio::fs::rename(unverified, verified).await.map_err(|e| {
        BackupError::Verification(format!(
            "cannot move {} to {}: {}",
            unverified.display(),
            verified.display(),
            e
        ))
    })
}

pub(crate) fn stream_error(err: reqwest::Error) -> io::Error {
    io::Error::other(err)
}
