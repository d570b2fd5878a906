//! Directory traversal with exclusion pruning.
//!
//! Entries are visited in a deterministic order (file names sorted within
//! each directory). An excluded directory is reported once and its subtree is
//! never entered.

use crate::fs::matcher::ExclusionMatcher;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Compiled exclusion patterns
    pub exclusions: ExclusionMatcher,
}

impl WalkOptions {
    pub fn with_exclusions<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            exclusions: ExclusionMatcher::new(patterns),
        }
    }
}

/// Filesystem type of a walked entry, as seen without following links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Sockets, FIFOs, devices
    Other,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// Size in bytes (0 for anything but regular files)
    pub size: u64,

    pub kind: EntryKind,

    /// Depth from root (direct children are 1)
    pub depth: usize,

    /// Matched an exclusion pattern
    pub excluded: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path, excluded: bool) -> std::io::Result<Self> {
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        let size = match kind {
            EntryKind::File if !excluded => entry.metadata().map_err(std::io::Error::from)?.len(),
            _ => 0,
        };

        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size,
            kind,
            depth: entry.depth(),
            excluded,
        })
    }
}

/// Walk a directory tree, calling `callback` for every entry below `root`.
///
/// The root itself is not reported. Excluded entries are reported with
/// `excluded = true`; excluded directories are not descended into.
///
/// # Arguments
/// * `root` - Root directory to start walking from (should be absolute)
/// * `options` - Walking options
/// * `callback` - Called for each entry discovered; an error stops the walk
pub fn walk_directory_with_callback<F, E>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> Result<(), E>
where
    F: FnMut(&FileInfo) -> Result<(), E>,
    E: From<std::io::Error>,
{
    // Links are archived as links, never followed
    let mut entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(std::io::Error::from)?;

        if entry.depth() == 0 {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let excluded = options.exclusions.is_excluded(entry.path(), relative);

        let info = FileInfo::from_entry(&entry, root, excluded)?;
        callback(&info)?;

        if excluded && info.kind == EntryKind::Directory {
            entries.skip_current_dir();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collect(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        walk_directory_with_callback(root, options, |info: &FileInfo| {
            out.push(info.clone());
            Ok::<(), std::io::Error>(())
        })?;
        Ok(out)
    }

    fn rel_names(infos: &[FileInfo]) -> Vec<String> {
        infos
            .iter()
            .filter(|i| !i.excluded)
            .map(|i| i.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = collect(temp_dir.path(), &WalkOptions::default())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_is_sorted_and_skips_root() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("b"))?;
        fs::write(temp_dir.path().join("b/inner.txt"), b"x")?;
        fs::write(temp_dir.path().join("a.txt"), b"content1")?;
        fs::write(temp_dir.path().join("c.txt"), b"content2")?;

        let files = collect(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(rel_names(&files), vec!["a.txt", "b", "b/inner.txt", "c.txt"]);
        assert_eq!(files[0].size, 8);
        assert_eq!(files[1].kind, EntryKind::Directory);

        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("node_modules/pkg"))?;
        fs::write(temp_dir.path().join("node_modules/pkg/index.js"), b"js")?;
        fs::write(temp_dir.path().join("main.rs"), b"fn main() {}")?;

        let options = WalkOptions::with_exclusions(&["node_modules"]);
        let files = collect(temp_dir.path(), &options)?;

        // The directory is reported once as excluded and nothing beneath it is visited
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.excluded && f.relative_path == Path::new("node_modules")));
        assert_eq!(rel_names(&files), vec!["main.rs"]);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_not_followed() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let target = TempDir::new()?;
        fs::write(target.path().join("outside.txt"), b"outside")?;
        std::os::unix::fs::symlink(target.path(), temp_dir.path().join("link"))?;

        let files = collect(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, EntryKind::Symlink);

        Ok(())
    }
}
