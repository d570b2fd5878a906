//! Artifact names and remote object keys.
//!
//! Names: `<YYYYMMDD-HHMMSS>_<token><suffix>`.
//! Keys: `[<prefix>/][<public-ip>/]<YYYYMMDD>/<name>`.

use crate::archive::codec::{CodecKind, Layout};
use chrono::{Local, NaiveDateTime};
use std::path::Path;

pub const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const DATE_FORMAT: &str = "%Y%m%d";

/// Token used when a directory path reduces to nothing (e.g. `/`).
pub const FALLBACK_TOKEN: &str = "backup";

const SEPARATOR: char = '/';

/// Wall-clock instant shared by every name and key of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(Local::now().naive_local())
    }

    /// `YYYYMMDD-HHMMSS`
    pub fn stamp(&self) -> String {
        self.0.format(STAMP_FORMAT).to_string()
    }

    /// `YYYYMMDD`
    pub fn date(&self) -> String {
        self.0.format(DATE_FORMAT).to_string()
    }
}

impl From<NaiveDateTime> for Timestamp {
    fn from(value: NaiveDateTime) -> Self {
        Self(value)
    }
}

/// Build the key prefix for one upload.
///
/// The user prefix is normalized to `seg/seg/` (empty segments dropped),
/// then `<ip>/<date>/` or `<date>/` is appended. The result never contains
/// `//` and always ends with exactly one separator.
pub fn build_prefix(user_prefix: &str, public_ip: Option<&str>, date: &str) -> String {
    let mut prefix = String::new();

    let segments = user_prefix
        .split(SEPARATOR)
        .chain(public_ip.into_iter())
        .chain(std::iter::once(date))
        .map(str::trim)
        .filter(|s| !s.is_empty());

    for segment in segments {
        prefix.push_str(segment);
        prefix.push(SEPARATOR);
    }

    prefix
}

/// Join a prefix from [`build_prefix`] with an artifact name.
pub fn object_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name.trim_start_matches(SEPARATOR))
}

/// Single file, compressed without a container.
pub fn file_artifact_name(stamp: &Timestamp, source: &Path, codec: CodecKind) -> String {
    format!("{}_{}{}", stamp.stamp(), stem(source), codec.suffix(Layout::Plain))
}

/// Several files in one container, named after the first.
pub fn files_artifact_name(stamp: &Timestamp, first: &Path, codec: CodecKind) -> String {
    format!(
        "{}_{}_files{}",
        stamp.stamp(),
        stem(first),
        codec.suffix(Layout::Container)
    )
}

pub fn directory_artifact_name(stamp: &Timestamp, dir: &Path, codec: CodecKind) -> String {
    format!(
        "{}_{}{}",
        stamp.stamp(),
        directory_token(dir),
        codec.suffix(Layout::Container)
    )
}

/// Raw snapshot compressed without a container, e.g. `..._etcd-snapshot.db.zst`.
pub fn snapshot_artifact_name(stamp: &Timestamp, token: &str, codec: CodecKind) -> String {
    format!("{}_{}{}", stamp.stamp(), token, codec.suffix(Layout::Plain))
}

/// `/var/lib/app/` becomes `var_lib_app`.
pub fn directory_token(dir: &Path) -> String {
    let text = dir.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
    let token = text.trim_matches(SEPARATOR).replace(SEPARATOR, "_");
    if token.is_empty() {
        FALLBACK_TOKEN.to_string()
    } else {
        token
    }
}

/// File name without its last extension.
fn stem(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_TOKEN.to_string())
}
