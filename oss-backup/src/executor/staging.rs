//! Per-item scratch space.
//!
//! Everything an item writes locally lives under one temporary directory:
//! raw snapshots in `raw/`, finished artifacts in `compressed/`. Dropping the
//! [`Staging`] removes the whole tree, whichever stage the item ended in.

use crate::transfer::key::Timestamp;
use crate::utils::errors::{BackupError, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

const RAW_DIR: &str = "raw";
const COMPRESSED_DIR: &str = "compressed";

pub struct Staging {
    dir: TempDir,
    raw: PathBuf,
    compressed: PathBuf,
}

impl Staging {
    pub fn create(work_dir: &Path, stamp: &Timestamp) -> Result<Self> {
        std::fs::create_dir_all(work_dir).map_err(|e| {
            BackupError::acquisition(format!("creating work dir {}", work_dir.display()), e)
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("oss-backup-{}-", stamp.stamp()))
            .tempdir_in(work_dir)
            .map_err(|e| {
                BackupError::acquisition(format!("creating staging dir in {}", work_dir.display()), e)
            })?;

        let raw = dir.path().join(RAW_DIR);
        let compressed = dir.path().join(COMPRESSED_DIR);
        for sub in [&raw, &compressed] {
            std::fs::create_dir(sub).map_err(|e| {
                BackupError::acquisition(format!("creating {}", sub.display()), e)
            })?;
        }

        debug!(path = %dir.path().display(), "Staging directory created");
        Ok(Self { dir, raw, compressed })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Location for an uncompressed snapshot.
    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.raw.join(name)
    }

    /// Location for the artifact that gets uploaded.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.compressed.join(name)
    }

    /// Remove the tree now, logging instead of failing.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Staging directory removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging directory"),
        }
    }
}
