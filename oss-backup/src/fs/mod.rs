//! Filesystem traversal and exclusion matching.

pub mod matcher;
pub mod walker;

pub use matcher::{is_excluded, ExclusionMatcher};
pub use walker::{walk_directory_with_callback, EntryKind, FileInfo, WalkOptions};
