//! Project-relative source identifiers. Both build trees must map a given
//! source file to the same `SourcePath` for the union to line up, so every
//! path goes through the same normalization: separators unified, `.` and
//! `..` resolved lexically, build-tree prefixes stripped, and `src/`
//! prepended when the path does not already start with it. A relative path
//! is never truncated, so `extras/brotli/src/util.c` and `src/util.c` stay
//! distinct.

use std::borrow::Borrow;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Suffix gcov appends to every report file.
pub const REPORT_EXTENSION: &str = ".gcov";

/// Absolute locations of toolchain and system files. Sources under these
/// are never project code, even when a `src` directory appears below them.
const SYSTEM_PREFIXES: &[&str] = &[
    "/usr/",
    "/opt/",
    "/lib/",
    "/lib64/",
    "/nix/",
    "/Library/",
    "/System/",
    "/Applications/",
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourcePath(String);

impl SourcePath {
    /// Normalize a relative path. Returns `None` when nothing but the
    /// `src` prefix would remain.
    pub fn new(path: &str) -> Option<Self> {
        normalize_relative(&path.replace('\\', "/"))
    }

    /// Derive a path from a report's `Source:` header.
    ///
    /// Relative paths keep every component. Absolute paths have the first
    /// matching prefix in `prefixes` removed (project root, then build
    /// roots). An absolute path outside all of them is project code only if
    /// it is not under a system location: the part after a directory named
    /// `project_name` is used when there is one, otherwise the part from
    /// the first `src` component. Anything else yields `None`.
    pub fn from_header(
        source: &str,
        prefixes: &[&Path],
        project_name: Option<&str>,
    ) -> Option<Self> {
        let source = source.trim().replace('\\', "/");
        if source.is_empty() {
            return None;
        }
        if !source.starts_with('/') {
            return normalize_relative(&source);
        }

        for prefix in prefixes {
            if let Ok(rest) = Path::new(&source).strip_prefix(prefix) {
                if let Some(rest) = rest.to_str() {
                    return normalize_relative(rest);
                }
            }
        }

        if SYSTEM_PREFIXES.iter().any(|p| source.starts_with(p)) {
            return None;
        }

        let segments = clean_segments(&source);
        if let Some(name) = project_name {
            if let Some(pos) = segments.iter().position(|s| *s == name) {
                return normalize_relative(&segments[pos + 1..].join("/"));
            }
        }
        let anchor = segments.iter().position(|s| *s == "src")?;
        from_segments(&segments[anchor..])
    }

    /// Reconstruct a path from a report file's location relative to its
    /// build root. Understands `gcov -p` mangling (`#` for `/`, `^` for
    /// `..`) and the `-l` form `unit.c##src#header.h.gcov`.
    pub fn from_report_location(relative: &Path) -> Option<Self> {
        let relative = relative.to_str()?.replace('\\', "/");
        let stripped = relative.strip_suffix(REPORT_EXTENSION).unwrap_or(&relative);
        let (parent, file_name) = match stripped.rsplit_once('/') {
            Some((parent, name)) => (Some(parent), name),
            None => (None, stripped),
        };

        if file_name.contains('#') {
            let mangled = match file_name.rsplit_once("##") {
                Some((_, tail)) => tail,
                None => file_name,
            };
            let demangled = mangled
                .split('#')
                .map(|s| if s == "^" { ".." } else { s })
                .collect::<Vec<_>>()
                .join("/");
            return normalize_relative(&demangled);
        }

        match parent {
            Some(parent) => normalize_relative(&format!("{parent}/{file_name}")),
            None => normalize_relative(file_name),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, f)| f)
    }

    pub fn dir(&self) -> &str {
        self.0.rsplit_once('/').map_or("", |(d, _)| d)
    }

    /// Sort key for display: directory first, then file name.
    pub fn display_key(&self) -> (&str, &str) {
        (self.dir(), self.file_name())
    }

    /// True for unit-test sources (`test_*`, `*_test`, `*_test_*`), which
    /// are measured but never reported as production coverage.
    pub fn is_test_source(&self) -> bool {
        let name = self.file_name();
        let stem = name.split_once('.').map_or(name, |(s, _)| s);
        stem.starts_with("test_") || stem.ends_with("_test") || stem.contains("_test_")
    }
}

fn clean_segments(path: &str) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out
}

fn normalize_relative(path: &str) -> Option<SourcePath> {
    let segments = clean_segments(path);
    if segments.first() == Some(&"src") {
        return from_segments(&segments);
    }
    let mut prefixed = vec!["src"];
    prefixed.extend(segments);
    from_segments(&prefixed)
}

fn from_segments(segments: &[&str]) -> Option<SourcePath> {
    if segments.len() < 2 {
        return None;
    }
    Some(SourcePath(segments.join("/")))
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SourcePath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SourcePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<SourcePath> for String {
    fn from(path: SourcePath) -> Self {
        path.0
    }
}

impl TryFrom<String> for SourcePath {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        SourcePath::new(&value).ok_or_else(|| format!("not a source path: '{value}'"))
    }
}
