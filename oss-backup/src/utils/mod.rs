//! Utility modules for the backup tool.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, BoxError, Result};
