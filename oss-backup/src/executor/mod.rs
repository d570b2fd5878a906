//! Backup job executor.
//!
//! One [`Pipeline`] per invocation drives every item through
//! acquire -> verify -> compress -> key -> upload, then removes whatever the
//! item staged locally. Items run one after another; a failed item is logged
//! and counted, and the batch moves on.

pub mod staging;

use crate::archive::{ArchiveResult, Archiver, CodecKind};
use crate::config::{DirSettings, FileSettings};
use crate::snapshot::{promote, unverified_path, verify_readable, write_stream, SnapshotSource};
use crate::transfer::key::{
    build_prefix, directory_artifact_name, file_artifact_name, files_artifact_name, object_key,
    snapshot_artifact_name, Timestamp,
};
use crate::transfer::stats::{format_bytes, format_speed, CompressionStats, StageTimer};
use crate::transfer::{IpLookup, IpResolver, ObjectStore};
use crate::utils::errors::{BackupError, Result};
use staging::Staging;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// What a filesystem job reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    File(PathBuf),
    Files(Vec<PathBuf>),
    Directory { root: PathBuf, excludes: Vec<String> },
}

impl SourceDescriptor {
    /// A single path compresses directly; several go into one container.
    pub fn from_files(mut paths: Vec<PathBuf>) -> Option<Self> {
        match paths.len() {
            0 => None,
            1 => paths.pop().map(SourceDescriptor::File),
            _ => Some(SourceDescriptor::Files(paths)),
        }
    }

    fn label(&self) -> String {
        match self {
            SourceDescriptor::File(path) => path.display().to_string(),
            SourceDescriptor::Files(paths) => format!("{} files", paths.len()),
            SourceDescriptor::Directory { root, .. } => root.display().to_string(),
        }
    }

    fn artifact_name(&self, stamp: &Timestamp, codec: CodecKind) -> String {
        match self {
            SourceDescriptor::File(path) => file_artifact_name(stamp, path, codec),
            SourceDescriptor::Files(paths) => {
                let first = paths.first().map(PathBuf::as_path).unwrap_or(Path::new(""));
                files_artifact_name(stamp, first, codec)
            }
            SourceDescriptor::Directory { root, .. } => directory_artifact_name(stamp, root, codec),
        }
    }
}

/// One unit of work.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub source: SourceDescriptor,
    pub codec: CodecKind,
    pub stamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Acquiring,
    Verifying,
    Compressing,
    KeyBuilding,
    Uploading,
    Cleaned,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Created => "created",
            Stage::Acquiring => "acquiring",
            Stage::Verifying => "verifying",
            Stage::Compressing => "compressing",
            Stage::KeyBuilding => "key-building",
            Stage::Uploading => "uploading",
            Stage::Cleaned => "cleaned",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Current stage of one item, for logs.
struct StageTracker {
    item: String,
    stage: Stage,
}

impl StageTracker {
    fn new(item: String) -> Self {
        Self {
            item,
            stage: Stage::Created,
        }
    }

    fn enter(&mut self, next: Stage) {
        debug!(item = %self.item, from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
    }

    fn fail(&mut self, err: &BackupError) {
        error!(item = %self.item, stage = %self.stage, error = %err, "Backup item failed");
        self.stage = Stage::Failed;
    }
}

/// Outcome of one uploaded item.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub key: String,
    pub stats: CompressionStats,
    pub uploaded_bytes: u64,

    /// Index/version reported by a snapshot source
    pub position: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    /// At least one item made it to the bucket.
    pub fn is_success(&self) -> bool {
        self.succeeded > 0
    }

    fn record(&mut self, outcome: &Result<JobReport>) {
        match outcome {
            Ok(_) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )
    }
}

pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    ip: Arc<dyn IpResolver>,
    prefix: String,
    work_dir: PathBuf,
    lookup: OnceCell<IpLookup>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        ip: Arc<dyn IpResolver>,
        prefix: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            ip,
            prefix: prefix.into(),
            work_dir: work_dir.into(),
            lookup: OnceCell::new(),
        }
    }

    /// Archive, upload and clean up one filesystem job.
    pub async fn run(&self, job: &ArchiveJob) -> Result<JobReport> {
        let mut tracker = StageTracker::new(job.source.label());
        let staging = match Staging::create(&self.work_dir, &job.stamp) {
            Ok(staging) => staging,
            Err(e) => {
                tracker.fail(&e);
                return Err(e);
            }
        };

        let outcome = self.archive_and_upload(job, &staging, &mut tracker).await;
        Self::finish(staging, tracker, outcome)
    }

    /// Snapshot a remote system and upload the compressed result.
    pub async fn run_snapshot(
        &self,
        source: &dyn SnapshotSource,
        codec: CodecKind,
        stamp: &Timestamp,
    ) -> Result<JobReport> {
        let mut tracker = StageTracker::new(format!("{} snapshot", source.kind()));
        let staging = match Staging::create(&self.work_dir, stamp) {
            Ok(staging) => staging,
            Err(e) => {
                tracker.fail(&e);
                return Err(e);
            }
        };

        let outcome = self
            .snapshot_and_upload(source, codec, stamp, &staging, &mut tracker)
            .await;
        Self::finish(staging, tracker, outcome)
    }

    /// Archive each directory as its own artifact.
    ///
    /// Missing entries are skipped. Only configuration errors abort the batch.
    pub async fn run_directories(
        &self,
        dirs: &DirSettings,
        codec: CodecKind,
        stamp: &Timestamp,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();

        for root in &dirs.paths {
            match tokio::fs::metadata(root).await {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    warn!(path = %root.display(), "Not a directory, skipping");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "Directory not accessible, skipping");
                    summary.skipped += 1;
                    continue;
                }
            }

            let job = ArchiveJob {
                source: SourceDescriptor::Directory {
                    root: root.clone(),
                    excludes: dirs.excludes.clone(),
                },
                codec,
                stamp: *stamp,
            };
            let outcome = self.run(&job).await;
            if let Err(e) = &outcome {
                if e.is_config() {
                    return Err(BackupError::Config(e.to_string()));
                }
            }
            summary.record(&outcome);
        }

        info!(summary = %summary, "Directory backup finished");
        Ok(summary)
    }

    /// Back up a file list as one artifact, after dropping unusable paths.
    pub async fn run_files(
        &self,
        files: &FileSettings,
        codec: CodecKind,
        stamp: &Timestamp,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut usable = Vec::with_capacity(files.paths.len());

        for path in &files.paths {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => {
                    warn!(path = %path.display(), "Is a directory, use the dir command; skipping");
                    summary.skipped += 1;
                }
                Ok(_) => usable.push(path.clone()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "File not accessible, skipping");
                    summary.skipped += 1;
                }
            }
        }

        let source = SourceDescriptor::from_files(usable).ok_or_else(|| {
            BackupError::Config("none of the given files exist or are readable".to_string())
        })?;

        let job = ArchiveJob {
            source,
            codec,
            stamp: *stamp,
        };
        let outcome = self.run(&job).await;
        if let Err(e) = &outcome {
            if e.is_config() {
                return Err(BackupError::Config(e.to_string()));
            }
        }
        summary.record(&outcome);

        info!(summary = %summary, "File backup finished");
        Ok(summary)
    }

    async fn archive_and_upload(
        &self,
        job: &ArchiveJob,
        staging: &Staging,
        tracker: &mut StageTracker,
    ) -> Result<JobReport> {
        // The archiver reads the source while it writes, so acquisition and
        // compression share one blocking task.
        tracker.enter(Stage::Acquiring);
        let name = job.source.artifact_name(&job.stamp, job.codec);
        let dest = staging.artifact_path(&name);

        tracker.enter(Stage::Compressing);
        let archiver = Archiver::new(job.codec);
        let source = match &job.source {
            SourceDescriptor::Directory { root, excludes } => SourceDescriptor::Directory {
                root: root.clone(),
                excludes: with_staging_excluded(excludes, staging),
            },
            other => other.clone(),
        };
        let timer = StageTimer::start();
        let artifact = tokio::task::spawn_blocking(move || match &source {
            SourceDescriptor::File(path) => archiver.archive_file(path, &dest),
            SourceDescriptor::Files(paths) => archiver.archive_files(paths, &dest),
            SourceDescriptor::Directory { root, excludes } => {
                archiver.archive_directory(root, excludes, &dest)
            }
        })
        .await
        .map_err(join_error)??;

        let stats = timer.finish(artifact.original_bytes, artifact.size_bytes);
        log_compression(&name, job.codec, &stats, &artifact);

        let (key, uploaded_bytes) = self.deliver(&artifact, &name, &job.stamp, tracker).await?;
        Ok(JobReport {
            key,
            stats,
            uploaded_bytes,
            position: None,
        })
    }

    async fn snapshot_and_upload(
        &self,
        source: &dyn SnapshotSource,
        codec: CodecKind,
        stamp: &Timestamp,
        staging: &Staging,
        tracker: &mut StageTracker,
    ) -> Result<JobReport> {
        let kind = source.kind();
        let raw = staging.raw_path(source.artifact_token());
        let unverified = unverified_path(&raw);

        tracker.enter(Stage::Acquiring);
        let acquire = async {
            let snapshot = source.acquire().await?;
            let written = write_stream(snapshot.stream, &unverified).await?;
            Ok::<_, BackupError>((snapshot.meta, written))
        };
        let (meta, written) = match source.deadline() {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                BackupError::acquisition(
                    format!("saving {} snapshot", kind),
                    format!("deadline of {:?} exceeded", limit),
                )
            })??,
            None => acquire.await?,
        };
        info!(
            source = %kind,
            position = ?meta.position,
            size = %format_bytes(written),
            "Snapshot saved"
        );

        tracker.enter(Stage::Verifying);
        verify_readable(&unverified).await?;
        if let Some(inspect) = source.inspector() {
            let path = unverified.clone();
            let summary = tokio::task::spawn_blocking(move || inspect(&path))
                .await
                .map_err(join_error)??;
            debug!(source = %kind, summary = %summary, "Snapshot structure verified");
        }
        promote(&unverified, &raw).await?;

        tracker.enter(Stage::Compressing);
        let name = snapshot_artifact_name(stamp, source.artifact_token(), codec);
        let dest = staging.artifact_path(&name);
        let archiver = Archiver::new(codec);
        let raw_path = raw.clone();
        let timer = StageTimer::start();
        let artifact = tokio::task::spawn_blocking(move || archiver.archive_file(&raw_path, &dest))
            .await
            .map_err(join_error)??;

        let stats = timer.finish(artifact.original_bytes, artifact.size_bytes);
        log_compression(&name, codec, &stats, &artifact);

        let (key, uploaded_bytes) = self.deliver(&artifact, &name, stamp, tracker).await?;
        Ok(JobReport {
            key,
            stats,
            uploaded_bytes,
            position: meta.position,
        })
    }

    /// Build the key and hand the artifact to the store.
    async fn deliver(
        &self,
        artifact: &ArchiveResult,
        name: &str,
        stamp: &Timestamp,
        tracker: &mut StageTracker,
    ) -> Result<(String, u64)> {
        tracker.enter(Stage::KeyBuilding);
        let prefix = self.key_prefix(stamp).await;
        let key = object_key(&prefix, name);

        tracker.enter(Stage::Uploading);
        info!(key = %key, destination = %self.store.describe(), "Uploading artifact");
        let uploaded = self.store.upload(&artifact.path, &key).await?;
        Ok((key, uploaded))
    }

    /// The public IP is looked up once and shared by every item.
    async fn key_prefix(&self, stamp: &Timestamp) -> String {
        let lookup = self
            .lookup
            .get_or_init(|| async {
                let lookup = self.ip.resolve().await;
                if let Some(advisory) = &lookup.advisory {
                    warn!(advisory = %advisory, "Public IP unavailable, keys will omit the IP segment");
                }
                lookup
            })
            .await;

        build_prefix(&self.prefix, lookup.segment().as_deref(), &stamp.date())
    }

    fn finish(
        staging: Staging,
        mut tracker: StageTracker,
        outcome: Result<JobReport>,
    ) -> Result<JobReport> {
        if let Err(e) = &outcome {
            tracker.fail(e);
        }
        staging.close();

        if let Ok(report) = &outcome {
            tracker.enter(Stage::Cleaned);
            info!(
                item = %tracker.item,
                key = %report.key,
                position = ?report.position,
                "Backup item complete"
            );
        }
        outcome
    }
}

/// A source tree may contain the work dir; never archive our own output.
fn with_staging_excluded(excludes: &[String], staging: &Staging) -> Vec<String> {
    let own = std::path::absolute(staging.path()).unwrap_or_else(|_| staging.path().to_path_buf());
    let mut patterns = excludes.to_vec();
    patterns.push(own.to_string_lossy().to_string());
    patterns
}

fn log_compression(name: &str, codec: CodecKind, stats: &CompressionStats, artifact: &ArchiveResult) {
    info!(
        artifact = %name,
        codec = %codec,
        original_bytes = stats.original_bytes,
        size_bytes = stats.compressed_bytes,
        ratio = ?stats.ratio_percent().map(|r| format!("{:.2}%", r)),
        throughput = %format_speed(stats.throughput()),
        entries = artifact.included().count(),
        "Compressed {}",
        stats
    );
}

fn join_error(err: tokio::task::JoinError) -> BackupError {
    BackupError::compression("background task", std::io::Error::other(err))
}
