//! Backup library
//!
//! Snapshots etcd and Consul, archives filesystem paths, and ships the
//! compressed artifacts to S3-compatible object storage.

pub mod archive;
pub mod cli;
pub mod config;
pub mod executor;
pub mod fs;
pub mod snapshot;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use executor::{BatchSummary, Pipeline};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
