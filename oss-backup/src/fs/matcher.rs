//! Exclusion pattern matching for directory archives.
//!
//! A pattern is compared against both representations of an entry: its
//! absolute path (for rooted patterns such as `/var/lib/app/cache`) and its
//! path relative to the archive root (for everything else, e.g. `*.log`,
//! `node_modules`, `build/`).
//!
//! Globs follow shell semantics: `*` and `?` never cross a `/`. A pattern that
//! fails to compile as a glob still participates in the exact and prefix rules;
//! only its glob rules are treated as "no match".

use globset::{GlobBuilder, GlobMatcher};
use std::path::{Path, MAIN_SEPARATOR};

const SEPARATOR: char = '/';

#[derive(Debug, Clone)]
struct Pattern {
    /// Normalized text, trailing separators removed
    text: String,

    /// Matches against the absolute path instead of the relative one
    rooted: bool,

    /// `None` when the text is not a valid glob
    glob: Option<GlobMatcher>,
}

impl Pattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let normalized = normalize(raw);
        let rooted = Path::new(raw).is_absolute() || normalized.starts_with(SEPARATOR);
        let text = normalized.trim_end_matches(SEPARATOR).to_string();

        let glob = GlobBuilder::new(&text)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .ok()
            .map(|g| g.compile_matcher());

        Some(Self { text, rooted, glob })
    }

    fn glob_matches(&self, candidate: &str) -> bool {
        self.glob
            .as_ref()
            .map(|g| g.is_match(candidate))
            .unwrap_or(false)
    }

    /// Exact match or strict descendant (`text` + separator prefix).
    fn covers(&self, candidate: &str) -> bool {
        candidate == self.text
            || (candidate.len() > self.text.len()
                && candidate.starts_with(self.text.as_str())
                && candidate[self.text.len()..].starts_with(SEPARATOR))
    }

    fn matches(&self, abs: &str, rel: &str) -> bool {
        if self.rooted {
            return self.covers(abs) || self.glob_matches(abs);
        }

        if self.glob_matches(rel) || self.covers(rel) {
            return true;
        }

        if rel.split(SEPARATOR).any(|part| self.glob_matches(part)) {
            return true;
        }

        let base = rel.rsplit(SEPARATOR).next().unwrap_or(rel);
        self.glob_matches(base)
    }
}

/// Compiled set of user exclusion patterns.
///
/// Built once per directory job and consulted for every entry of the walk.
#[derive(Debug, Clone, Default)]
pub struct ExclusionMatcher {
    patterns: Vec<Pattern>,
}

impl ExclusionMatcher {
    /// Compile `patterns`, ignoring blank entries.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| Pattern::parse(p.as_ref()))
                .collect(),
        }
    }

    /// True when no usable pattern was supplied.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Decide whether the entry at `abs` (relative form `rel`) is excluded.
    ///
    /// Short-circuits on the first pattern that matches by any rule.
    pub fn is_excluded(&self, abs: &Path, rel: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }

        let abs = normalize_path(abs);
        let rel = normalize_path(rel);

        self.patterns.iter().any(|p| p.matches(&abs, &rel))
    }
}

/// One-shot form of [`ExclusionMatcher::is_excluded`].
///
/// Prefer building an [`ExclusionMatcher`] when checking many entries.
pub fn is_excluded<S: AsRef<str>>(abs: &Path, rel: &Path, patterns: &[S]) -> bool {
    ExclusionMatcher::new(patterns).is_excluded(abs, rel)
}

fn normalize(text: &str) -> String {
    if MAIN_SEPARATOR == SEPARATOR {
        text.to_string()
    } else {
        text.replace(MAIN_SEPARATOR, "/")
    }
}

fn normalize_path(path: &Path) -> String {
    let text = normalize(&path.to_string_lossy());
    let trimmed = text.trim_end_matches(SEPARATOR);
    if trimmed.is_empty() && text.starts_with(SEPARATOR) {
        // The filesystem root keeps its single separator
        return SEPARATOR.to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excluded(rel: &str, patterns: &[&str]) -> bool {
        let abs = format!("/data/{}", rel);
        is_excluded(Path::new(&abs), Path::new(rel), patterns)
    }

    #[test]
    fn test_empty_pattern_list_excludes_nothing() {
        let none: [&str; 0] = [];
        assert!(!excluded("a.txt", &none));
        assert!(ExclusionMatcher::new(&none).is_empty());
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        let matcher = ExclusionMatcher::new(&["", "   ", "\t"]);
        assert!(matcher.is_empty());
        assert!(!matcher.is_excluded(Path::new("/data/a.txt"), Path::new("a.txt")));
    }

    #[test]
    fn test_extension_glob_matches_base_name() {
        assert!(excluded("b.log", &["*.log"]));
        assert!(excluded("logs/2024/app.log", &["*.log"]));
        assert!(!excluded("a.txt", &["*.log"]));
        assert!(!excluded("b.log.txt", &["*.log"]));
    }

    #[test]
    fn test_component_match_excludes_nested_directories() {
        assert!(excluded("web/node_modules", &["node_modules"]));
        assert!(excluded("web/node_modules/left-pad/index.js", &["node_modules"]));
        assert!(!excluded("web/node_modules_backup/index.js", &["node_modules"]));
    }

    #[test]
    fn test_trailing_separator_matches_directory_and_contents() {
        assert!(excluded("build", &["build/"]));
        assert!(excluded("build/out.o", &["build/"]));
        assert!(!excluded("builder/out.o", &["build/"]));
    }

    #[test]
    fn test_relative_prefix_requires_separator_boundary() {
        assert!(excluded("cache/tmp", &["cache/tmp"]));
        assert!(excluded("cache/tmp/a.bin", &["cache/tmp"]));
        assert!(!excluded("cache/tmpfile", &["cache/tmp"]));
    }

    #[test]
    fn test_relative_glob_does_not_cross_separators() {
        assert!(excluded("tmp/a.bin", &["tmp/*.bin"]));
        assert!(!excluded("tmp/sub/a.bin", &["tmp/*.bin"]));
    }

    #[test]
    fn test_rooted_pattern_matches_absolute_path() {
        let matcher = ExclusionMatcher::new(&["/data/secret"]);
        assert!(matcher.is_excluded(Path::new("/data/secret"), Path::new("secret")));
        assert!(matcher.is_excluded(
            Path::new("/data/secret/key.pem"),
            Path::new("secret/key.pem")
        ));
        assert!(!matcher.is_excluded(Path::new("/data/secrets"), Path::new("secrets")));
    }

    #[test]
    fn test_rooted_pattern_ignores_relative_form() {
        // "/secret" is rooted, so the relative path "secret" must not match it
        let matcher = ExclusionMatcher::new(&["/secret"]);
        assert!(!matcher.is_excluded(Path::new("/data/secret"), Path::new("secret")));
    }

    #[test]
    fn test_rooted_glob() {
        let matcher = ExclusionMatcher::new(&["/data/*.tmp"]);
        assert!(matcher.is_excluded(Path::new("/data/x.tmp"), Path::new("x.tmp")));
        assert!(!matcher.is_excluded(Path::new("/data/sub/x.tmp"), Path::new("sub/x.tmp")));
    }

    #[test]
    fn test_malformed_glob_is_not_fatal() {
        assert!(!excluded("a.txt", &["[abc"]));
        // The literal rules still apply to a pattern that is not a valid glob
        assert!(excluded("[abc", &["[abc"]));
    }

    #[test]
    fn test_first_matching_pattern_wins() {
        assert!(excluded("keep/b.log", &["*.txt", "*.log"]));
    }
}
