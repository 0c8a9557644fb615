//! Exclusion rules for coverage accounting.
//!
//! Rules come from the project's ignore file (one pattern per line, `#`
//! comments and blank lines skipped, leading `./` stripped) followed by a
//! fixed list of built-ins. A source path is excluded when any pattern is a
//! substring of it. Trailing slashes are not special: `vendor/` simply
//! matches paths containing that text.
//!
//! The set is loaded once by the driver and handed by reference to every
//! scan; it never changes after construction.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::source_path::SourcePath;

/// Ignore file name looked up in the project root.
pub const DEFAULT_IGNORE_FILE: &str = ".trial-ignore";

/// Always-on exclusions: mock objects, bundled third-party libraries and
/// the unit-test framework's own source.
pub const BUILTIN_PATTERNS: &[&str] = &[
    "mock_",
    "/mocks/",
    "/unity.c",
    "third_party/",
    "vendor/",
    "jansson",
    "microhttpd",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRuleSet {
    patterns: Vec<String>,
    warnings: Vec<String>,
}

impl IgnoreRuleSet {
    /// Built-in patterns only.
    pub fn builtin() -> Self {
        Self::from_patterns(std::iter::empty::<String>())
    }

    /// Project patterns (in order) followed by the built-ins.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all: Vec<String> = patterns.into_iter().map(Into::into).collect();
        all.extend(BUILTIN_PATTERNS.iter().map(|p| p.to_string()));
        Self {
            patterns: all,
            warnings: Vec::new(),
        }
    }

    /// Load `<project_root>/.trial-ignore`.
    pub fn load(project_root: &Path) -> Self {
        Self::load_file(&project_root.join(DEFAULT_IGNORE_FILE))
    }

    /// Load a specific ignore file. A missing file yields the built-ins; an
    /// unreadable one does too, with a warning recorded on the set.
    pub fn load_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let patterns = parse_ignore_file(&content);
                tracing::debug!(
                    file = %path.display(),
                    count = patterns.len(),
                    "loaded ignore patterns"
                );
                Self::from_patterns(patterns)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(file = %path.display(), "no ignore file, using built-ins");
                Self::builtin()
            }
            Err(e) => {
                let warning = format!(
                    "could not read ignore file {}: {e}; using built-in patterns only",
                    path.display()
                );
                tracing::warn!("{warning}");
                let mut rules = Self::builtin();
                rules.warnings.push(warning);
                rules
            }
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Problems hit while loading; the set is still usable.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Should this source be left out of coverage accounting?
    pub fn matches(&self, path: &SourcePath) -> bool {
        self.matches_str(path.as_str())
    }

    pub fn matches_str(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| path.contains(p.as_str()))
    }

    /// Stable hash of the active patterns: sorted and deduplicated, so only
    /// a change in the effective rule set changes it.
    pub fn fingerprint(&self) -> String {
        let mut sorted: Vec<&str> = self.patterns.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut ctx = Sha256::new();
        for pattern in sorted {
            ctx.update(pattern.as_bytes());
            ctx.update(b"\n");
        }
        hex::encode(ctx.finalize())
    }
}

/// Extract patterns from ignore-file content.
pub fn parse_ignore_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.strip_prefix("./").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
