//! Error taxonomy for backup jobs.
//!
//! Each variant names the pipeline stage that failed and carries the
//! underlying cause, so a log line always says what was being attempted.

use thiserror::Error;

/// Boxed cause used by stages whose failures come from heterogeneous clients.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Missing or invalid settings. Fatal for the whole invocation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The source could not produce its raw bytes.
    #[error("Acquisition error: {context}: {source}")]
    Acquisition {
        context: String,
        #[source]
        source: BoxError,
    },

    /// The acquired artifact is empty, unreadable or structurally invalid.
    #[error("Verification error: {0}")]
    Verification(String),

    /// Codec construction or streaming failure while writing an artifact.
    #[error("Compression error: {context}: {source}")]
    Compression {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The object store rejected or failed the transfer.
    #[error("Upload error: {context}: {source}")]
    Upload {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn acquisition(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BackupError::Acquisition {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn compression(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Compression {
            context: context.into(),
            source,
        }
    }

    pub fn upload(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BackupError::Upload {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Configuration problems abort a batch; everything else only fails the item.
    pub fn is_config(&self) -> bool {
        matches!(self, BackupError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
