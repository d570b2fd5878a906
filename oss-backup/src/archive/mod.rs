//! Archiver: turns a file, a file list or a directory tree into one
//! compressed artifact on local disk.
//!
//! Everything here is blocking I/O. Async callers run it on
//! `tokio::task::spawn_blocking`.

pub mod codec;

pub use codec::{CodecKind, CodecWriter, Layout};

use crate::fs::walker::{walk_directory_with_callback, EntryKind, FileInfo, WalkOptions};
use crate::utils::errors::BackupError;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Write buffer in front of the destination file (1MB)
const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("source not accessible: {path}: {source}")]
    SourceMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("is a directory, expected a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("no files to archive")]
    NoFiles,

    #[error("failed walking source tree: {0}")]
    Walk(#[from] io::Error),

    #[error("{context}: {source}")]
    Stream {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn stream(context: impl Into<String>, source: io::Error) -> Self {
        ArchiveError::Stream {
            context: context.into(),
            source,
        }
    }
}

impl From<ArchiveError> for BackupError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::NoFiles => BackupError::Config(err.to_string()),
            ArchiveError::Stream { context, source } => BackupError::compression(context, source),
            other => BackupError::acquisition("reading archive source", other),
        }
    }
}

/// What happened to one walked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Included,
    /// Matched an exclusion pattern (directories take their subtree with them)
    Excluded,
    /// Neither file, directory nor symlink
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub relative_path: PathBuf,
    pub kind: EntryKind,
    pub decision: Decision,
}

impl EntryDecision {
    fn new(info: &FileInfo, decision: Decision) -> Self {
        Self {
            relative_path: info.relative_path.clone(),
            kind: info.kind,
            decision,
        }
    }
}

/// Local artifact produced by one archive call.
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub path: PathBuf,

    /// Bytes written to `path`
    pub size_bytes: u64,

    /// Uncompressed bytes of regular file content that went in
    pub original_bytes: u64,

    /// Per-entry decisions; only populated for directory archives
    pub entries: Vec<EntryDecision>,
}

impl ArchiveResult {
    pub fn included(&self) -> impl Iterator<Item = &EntryDecision> {
        self.entries
            .iter()
            .filter(|e| e.decision == Decision::Included)
    }
}

/// Writes artifacts with a fixed codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Archiver {
    codec: CodecKind,
}

impl Archiver {
    pub fn new(codec: CodecKind) -> Self {
        Self { codec }
    }

    /// Archive the tree under `root` into a tar container at `dest`.
    ///
    /// Entry names are relative to `root`. Symlinks are stored as links.
    pub fn archive_directory<S: AsRef<str>>(
        &self,
        root: &Path,
        excludes: &[S],
        dest: &Path,
    ) -> Result<ArchiveResult, ArchiveError> {
        let metadata = fs::metadata(root).map_err(|source| ArchiveError::SourceMissing {
            path: root.to_path_buf(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(ArchiveError::NotADirectory(root.to_path_buf()));
        }

        // Rooted patterns are compared against absolute paths
        let root = std::path::absolute(root).map_err(|source| ArchiveError::SourceMissing {
            path: root.to_path_buf(),
            source,
        })?;
        let options = WalkOptions::with_exclusions(excludes);

        let mut entries = Vec::new();
        let mut original_bytes = 0u64;

        let size_bytes = self.write_artifact(dest, |writer| {
            let mut tar = tar::Builder::new(writer);
            tar.follow_symlinks(false);

            walk_directory_with_callback(&root, &options, |info: &FileInfo| -> Result<(), ArchiveError> {
                if info.excluded {
                    debug!(path = %info.relative_path.display(), "Excluded from archive");
                    entries.push(EntryDecision::new(info, Decision::Excluded));
                    return Ok(());
                }

                if info.kind == EntryKind::Other {
                    warn!(path = %info.path.display(), "Skipping special file");
                    entries.push(EntryDecision::new(info, Decision::Unsupported));
                    return Ok(());
                }

                if info.kind == EntryKind::File {
                    original_bytes += append_bounded(&mut tar, &info.path, &info.relative_path)?;
                } else {
                    tar.append_path_with_name(&info.path, &info.relative_path)
                        .map_err(|e| {
                            ArchiveError::stream(format!("adding {} to archive", info.path.display()), e)
                        })?;
                }

                entries.push(EntryDecision::new(info, Decision::Included));
                Ok(())
            })?;

            tar.into_inner()
                .map_err(|e| ArchiveError::stream("writing archive trailer", e))?;
            Ok(())
        })?;

        Ok(ArchiveResult {
            path: dest.to_path_buf(),
            size_bytes,
            original_bytes,
            entries,
        })
    }

    /// Compress a single file to `dest` without a container.
    pub fn archive_file(&self, source: &Path, dest: &Path) -> Result<ArchiveResult, ArchiveError> {
        let original_bytes = regular_file_len(source)?;
        let mut input = File::open(source).map_err(|source_err| ArchiveError::SourceMissing {
            path: source.to_path_buf(),
            source: source_err,
        })?;

        let size_bytes = self.write_artifact(dest, |writer| {
            io::copy(&mut input, writer)
                .map_err(|e| ArchiveError::stream(format!("compressing {}", source.display()), e))?;
            Ok(())
        })?;

        Ok(ArchiveResult {
            path: dest.to_path_buf(),
            size_bytes,
            original_bytes,
            entries: Vec::new(),
        })
    }

    /// Pack `sources` into a tar container at `dest`, each stored under its
    /// base name. Same-named files are all written, in order.
    pub fn archive_files<P: AsRef<Path>>(
        &self,
        sources: &[P],
        dest: &Path,
    ) -> Result<ArchiveResult, ArchiveError> {
        if sources.is_empty() {
            return Err(ArchiveError::NoFiles);
        }

        let mut original_bytes = 0u64;
        for source in sources {
            original_bytes += regular_file_len(source.as_ref())?;
        }

        let size_bytes = self.write_artifact(dest, |writer| {
            let mut tar = tar::Builder::new(writer);

            for source in sources {
                let source = source.as_ref();
                let name = base_name(source);
                append_bounded(&mut tar, source, Path::new(&name))?;
                debug!(path = %source.display(), name = %name, "Added file to archive");
            }

            tar.into_inner()
                .map_err(|e| ArchiveError::stream("writing archive trailer", e))?;
            Ok(())
        })?;

        Ok(ArchiveResult {
            path: dest.to_path_buf(),
            size_bytes,
            original_bytes,
            entries: Vec::new(),
        })
    }

    /// Open `dest`, run `body` against the codec writer, then close the codec
    /// and the file in that order. Both are closed even when `body` fails;
    /// the body's error takes precedence. Returns the artifact size.
    fn write_artifact<F>(&self, dest: &Path, body: F) -> Result<u64, ArchiveError>
    where
        F: FnOnce(&mut CodecWriter<BufWriter<File>>) -> Result<(), ArchiveError>,
    {
        let file = File::create(dest)
            .map_err(|e| ArchiveError::stream(format!("creating {}", dest.display()), e))?;
        let mut writer = self
            .codec
            .encoder(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file))
            .map_err(|e| ArchiveError::stream(format!("opening {} encoder", self.codec), e))?;

        let outcome = body(&mut writer);

        let closed = writer
            .finish()
            .and_then(|buffered| buffered.into_inner().map_err(|e| e.into_error()))
            .and_then(|file| {
                file.sync_all()?;
                file.metadata().map(|m| m.len())
            });

        outcome?;
        closed.map_err(|e| ArchiveError::stream(format!("finalizing {}", dest.display()), e))
    }
}

/// Append a regular file, copying exactly the length recorded in its header.
///
/// Bytes appended after the header was written are left out; a file that
/// shrinks underneath us fails the archive. Returns the entry size.
fn append_bounded<W: Write>(
    tar: &mut tar::Builder<W>,
    path: &Path,
    name: &Path,
) -> Result<u64, ArchiveError> {
    let file = File::open(path).map_err(|source| ArchiveError::SourceMissing {
        path: path.to_path_buf(),
        source,
    })?;
    let metadata = file
        .metadata()
        .map_err(|e| ArchiveError::stream(format!("reading metadata of {}", path.display()), e))?;

    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Complete);
    let len = metadata.len();

    tar.append_data(&mut header, name, ExactReader::new(file, len))
        .map_err(|e| ArchiveError::stream(format!("adding {} to archive", path.display()), e))?;
    Ok(len)
}

/// Yields exactly `remaining` bytes of `inner`, erroring on early EOF.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while archiving, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn regular_file_len(path: &Path) -> Result<u64, ArchiveError> {
    let metadata = fs::metadata(path).map_err(|source| ArchiveError::SourceMissing {
        path: path.to_path_buf(),
        source,
    })?;
    if metadata.is_dir() {
        return Err(ArchiveError::NotAFile(path.to_path_buf()));
    }
    Ok(metadata.len())
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALL: [CodecKind; 3] = [CodecKind::Store, CodecKind::Gzip, CodecKind::Zstd];

    struct Unpacked {
        path: String,
        entry_type: tar::EntryType,
        content: Vec<u8>,
    }

    fn unpack(path: &Path, codec: CodecKind) -> Vec<Unpacked> {
        let reader = codec.decoder(File::open(path).unwrap()).unwrap();
        let mut archive = tar::Archive::new(reader);
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push(Unpacked {
                path: entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                entry_type: entry.header().entry_type(),
                content,
            });
        }
        out
    }

    fn names(entries: &[Unpacked]) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("b.log"), b"noise").unwrap();
        fs::create_dir_all(dir.path().join("cache/deep")).unwrap();
        fs::write(dir.path().join("cache/deep/blob.bin"), vec![7u8; 4096]).unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/readme.md"), b"# readme").unwrap();
        dir
    }

    #[test]
    fn test_directory_archive_drops_excluded_extension() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"keep me").unwrap();
        fs::write(src.path().join("b.log"), b"drop me").unwrap();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("data.tar.zst");

        let result = Archiver::new(CodecKind::Zstd)
            .archive_directory(src.path(), &["*.log"], &dest)
            .unwrap();

        let entries = unpack(&dest, CodecKind::Zstd);
        assert_eq!(names(&entries), vec!["a.txt"]);
        assert_eq!(entries[0].content, b"keep me");
        assert_eq!(result.included().count(), 1);
        assert_eq!(result.original_bytes, 7);
        assert_eq!(result.size_bytes, fs::metadata(&dest).unwrap().len());
    }

    #[test]
    fn test_directory_round_trip_for_every_codec() {
        let src = sample_tree();
        let out = TempDir::new().unwrap();

        for codec in ALL {
            let dest = out.path().join(format!("tree{}", codec.suffix(Layout::Container)));
            Archiver::new(codec)
                .archive_directory(src.path(), &["cache"], &dest)
                .unwrap();

            let entries = unpack(&dest, codec);
            assert_eq!(names(&entries), vec!["a.txt", "b.log", "docs", "docs/readme.md"]);
            for entry in entries.iter().filter(|e| e.entry_type.is_file()) {
                let original = fs::read(src.path().join(&entry.path)).unwrap();
                assert_eq!(entry.content, original, "{} via {}", entry.path, codec);
            }
            assert!(entries[2].entry_type.is_dir());
        }
    }

    #[test]
    fn test_excluded_directory_takes_whole_subtree() {
        let src = sample_tree();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("tree.tar");

        let result = Archiver::new(CodecKind::Store)
            .archive_directory(src.path(), &["cache/"], &dest)
            .unwrap();

        let entries = unpack(&dest, CodecKind::Store);
        assert!(entries.iter().all(|e| !e.path.starts_with("cache")));

        // Pruned: the directory is decided once and its children never visited
        let excluded: Vec<_> = result
            .entries
            .iter()
            .filter(|e| e.decision == Decision::Excluded)
            .collect();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].relative_path, Path::new("cache"));
    }

    #[test]
    fn test_pattern_matching_nothing_changes_nothing() {
        let src = sample_tree();
        let out = TempDir::new().unwrap();
        let plain = out.path().join("plain.tar");
        let filtered = out.path().join("filtered.tar");
        let archiver = Archiver::new(CodecKind::Store);
        let none: [&str; 0] = [];

        archiver.archive_directory(src.path(), &none, &plain).unwrap();
        archiver
            .archive_directory(src.path(), &["*.nothing", "/no/such/root"], &filtered)
            .unwrap();

        let a = unpack(&plain, CodecKind::Store);
        let b = unpack(&filtered, CodecKind::Store);
        assert_eq!(names(&a), names(&b));
        assert!(a.iter().zip(&b).all(|(x, y)| x.content == y.content));
    }

    #[test]
    fn test_empty_directory_yields_empty_container() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();

        for codec in ALL {
            let dest = out.path().join(format!("empty{}", codec.suffix(Layout::Container)));
            let result = Archiver::new(codec)
                .archive_directory(src.path(), &[] as &[&str], &dest)
                .unwrap();
            assert!(result.entries.is_empty());
            assert!(unpack(&dest, codec).is_empty());
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_is_stored_as_link() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("target.txt"), b"real").unwrap();
        std::os::unix::fs::symlink("target.txt", src.path().join("link")).unwrap();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("links.tar.zst");

        Archiver::new(CodecKind::Zstd)
            .archive_directory(src.path(), &[] as &[&str], &dest)
            .unwrap();

        let entries = unpack(&dest, CodecKind::Zstd);
        let link = entries.iter().find(|e| e.path == "link").unwrap();
        assert!(link.entry_type.is_symlink());
        assert!(link.content.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_directory_archive_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let secret = src.path().join("secret.conf");
        fs::write(&secret, b"token=abc").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o640)).unwrap();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("modes.tar.zst");

        Archiver::new(CodecKind::Zstd)
            .archive_directory(src.path(), &[] as &[&str], &dest)
            .unwrap();

        let reader = CodecKind::Zstd.decoder(File::open(&dest).unwrap()).unwrap();
        let mut archive = tar::Archive::new(reader);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap(), Path::new("secret.conf"));
        assert_eq!(entry.header().mode().unwrap() & 0o7777, 0o640);
        assert_eq!(entry.header().size().unwrap(), 9);

        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"token=abc");
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_entry_copy_stops_at_recorded_length() {
        let mut copied = Vec::new();
        ExactReader::new(&b"recorded-then-appended"[..], 8)
            .read_to_end(&mut copied)
            .unwrap();
        assert_eq!(copied, b"recorded");

        let err = ExactReader::new(&b"short"[..], 10)
            .read_to_end(&mut Vec::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_missing_directory_is_source_error() {
        let out = TempDir::new().unwrap();
        let err = Archiver::default()
            .archive_directory(Path::new("/definitely/not/here"), &[] as &[&str], &out.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SourceMissing { .. }));
        assert!(matches!(BackupError::from(err), BackupError::Acquisition { .. }));
    }

    #[test]
    fn test_single_file_round_trip() {
        let src = TempDir::new().unwrap();
        let input = src.path().join("report.csv");
        let payload = b"id,value\n1,42\n".repeat(1000);
        fs::write(&input, &payload).unwrap();
        let out = TempDir::new().unwrap();

        for codec in ALL {
            let dest = out.path().join(format!("report-{}.csv{}", codec, codec.suffix(Layout::Plain)));
            let result = Archiver::new(codec).archive_file(&input, &dest).unwrap();
            assert_eq!(result.original_bytes, payload.len() as u64);

            let mut decoded = Vec::new();
            codec
                .decoder(File::open(&dest).unwrap())
                .unwrap()
                .read_to_end(&mut decoded)
                .unwrap();
            assert_eq!(decoded, payload, "codec {}", codec);
        }
    }

    #[test]
    fn test_zero_byte_file_round_trips_to_zero_bytes() {
        let src = TempDir::new().unwrap();
        let input = src.path().join("empty");
        fs::write(&input, b"").unwrap();
        let out = TempDir::new().unwrap();

        for codec in ALL {
            let dest = out.path().join(format!("empty-{}", codec));
            Archiver::new(codec).archive_file(&input, &dest).unwrap();
            let mut decoded = Vec::new();
            codec
                .decoder(File::open(&dest).unwrap())
                .unwrap()
                .read_to_end(&mut decoded)
                .unwrap();
            assert!(decoded.is_empty());
        }
    }

    #[test]
    fn test_file_list_keeps_duplicate_base_names() {
        let x = TempDir::new().unwrap();
        let y = TempDir::new().unwrap();
        fs::write(x.path().join("a.csv"), b"from x").unwrap();
        fs::write(y.path().join("a.csv"), b"from y").unwrap();
        let out = TempDir::new().unwrap();
        let dest = out.path().join("files.tgz");

        Archiver::new(CodecKind::Gzip)
            .archive_files(&[x.path().join("a.csv"), y.path().join("a.csv")], &dest)
            .unwrap();

        let entries = unpack(&dest, CodecKind::Gzip);
        assert_eq!(names(&entries), vec!["a.csv", "a.csv"]);
        assert_eq!(entries[0].content, b"from x");
        assert_eq!(entries[1].content, b"from y");
    }

    #[test]
    fn test_file_list_rejects_empty_and_directories() {
        let out = TempDir::new().unwrap();
        let archiver = Archiver::default();
        let none: [PathBuf; 0] = [];

        let err = archiver.archive_files(&none, &out.path().join("x")).unwrap_err();
        assert!(matches!(err, ArchiveError::NoFiles));
        assert!(!out.path().join("x").exists());

        let err = archiver
            .archive_files(&[out.path()], &out.path().join("y"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotAFile(_)));
    }

    #[test]
    fn test_unwritable_destination_is_stream_error() {
        let src = TempDir::new().unwrap();
        let input = src.path().join("f");
        fs::write(&input, b"x").unwrap();

        let err = Archiver::default()
            .archive_file(&input, &src.path().join("missing-dir/out.zst"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Stream { .. }));
        assert!(matches!(BackupError::from(err), BackupError::Compression { .. }));
    }
}
