//! Batch scanning of two gcov build trees.
//!
//! A scan walks both roots for `*.gcov` reports, maps every report to the
//! `SourcePath` it describes, drops test sources and ignored paths, groups
//! the rest by path and measures each group. Resolving and measuring run
//! on a rayon pool; each group is owned by exactly one worker, so the only
//! shared step is collecting the finished figures.
//!
//! A missing or empty root is not an error: the scan just has nothing from
//! that side.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::cache::Inventory;
use crate::discrepancy::Strategy;
use crate::error::{CovError, Result};
use crate::gcov;
use crate::ignore::IgnoreRuleSet;
use crate::model::{CoverageReport, SourceCoverage};
use crate::source_path::{SourcePath, REPORT_EXTENSION};

/// Directory holding the unit-test framework's own build output. Reports
/// beneath it are never production coverage.
pub const FRAMEWORK_BUILD_DIR: &str = "Unity";

/// Which build tree a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Unity,
    Blackbox,
}

/// The two build trees to scan, plus the project root used to strip
/// absolute `Source:` paths.
#[derive(Debug, Clone)]
pub struct BuildRoots {
    pub unity: PathBuf,
    pub blackbox: PathBuf,
    pub project_root: Option<PathBuf>,
}

impl BuildRoots {
    pub fn new(unity: impl Into<PathBuf>, blackbox: impl Into<PathBuf>) -> Self {
        Self {
            unity: unity.into(),
            blackbox: blackbox.into(),
            project_root: None,
        }
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    /// Identifies these roots in the result cache. The project root is part
    /// of it because it decides how absolute `Source:` paths are stripped.
    pub fn scope(&self) -> String {
        let project = self
            .project_root
            .as_deref()
            .map(|p| canonical_or_given(p).display().to_string())
            .unwrap_or_default();
        format!(
            "project={project};unity={};blackbox={}",
            canonical_or_given(&self.unity).display(),
            canonical_or_given(&self.blackbox).display()
        )
    }

    fn prefixes(&self) -> Vec<PathBuf> {
        self.project_root
            .iter()
            .chain([&self.unity, &self.blackbox])
            .map(|p| canonical_or_given(p))
            .collect()
    }

    /// Directory name of the project root, used to recognize the project's
    /// own files in a checkout at some other absolute location.
    fn project_name(&self) -> Option<String> {
        let root = canonical_or_given(self.project_root.as_deref()?);
        Some(root.file_name()?.to_str()?.to_string())
    }
}

fn canonical_or_given(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Modification time and size of a report when it was discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// A report file found under one of the build roots.
#[derive(Debug, Clone)]
pub struct ReportFile {
    pub path: PathBuf,
    /// Location relative to its build root.
    pub relative: PathBuf,
    pub side: Side,
    stamp: Stamp,
}

impl ReportFile {
    pub fn modified(&self) -> Option<SystemTime> {
        self.stamp.modified
    }
}

/// Find every report under `root`, skipping the framework's build output.
/// Results are ordered by path.
pub fn discover(root: &Path, side: Side) -> Vec<ReportFile> {
    if !root.is_dir() {
        tracing::debug!(root = %root.display(), ?side, "build root absent");
        return Vec::new();
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() > 0 && e.file_type().is_dir() && e.file_name() == FRAMEWORK_BUILD_DIR)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %root.display(), "skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_report = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.ends_with(REPORT_EXTENSION));
        if !is_report {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), "cannot stat report: {e}");
                continue;
            }
        };
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        files.push(ReportFile {
            path: entry.path().to_path_buf(),
            relative,
            side,
            stamp: Stamp {
                modified: metadata.modified().ok(),
                len: metadata.len(),
            },
        });
    }

    tracing::debug!(root = %root.display(), ?side, reports = files.len(), "discovered reports");
    files
}

/// Every report a scan of `roots` would read, reduced to a count, a digest
/// over paths and stamps, and the newest mtime. Adding, removing or
/// rewriting any report (or removing a whole root) changes the digest.
pub fn inventory(roots: &BuildRoots) -> Inventory {
    let files: Vec<ReportFile> = discover(&roots.unity, Side::Unity)
        .into_iter()
        .chain(discover(&roots.blackbox, Side::Blackbox))
        .collect();

    let mut ctx = Sha256::new();
    for file in &files {
        ctx.update(match file.side {
            Side::Unity => b"u\0",
            Side::Blackbox => b"b\0",
        });
        ctx.update(file.path.to_string_lossy().as_bytes());
        ctx.update(b"\0");
        let nanos = file
            .stamp
            .modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        ctx.update(nanos.to_le_bytes());
        ctx.update(file.stamp.len.to_le_bytes());
    }

    Inventory {
        reports: files.len() as u64,
        digest: hex::encode(ctx.finalize()),
        newest: files.iter().filter_map(ReportFile::modified).max(),
    }
}

/// Scan both trees from scratch with the production strategy.
pub fn scan(unity_root: &Path, blackbox_root: &Path, rules: &IgnoreRuleSet) -> CoverageReport {
    let roots = BuildRoots::new(unity_root, blackbox_root);
    // Without an interrupt flag a scan cannot fail.
    Scanner::new(rules).scan(&roots).unwrap_or_default()
}

#[derive(Debug, Default)]
struct Group {
    unity: Vec<ReportFile>,
    blackbox: Vec<ReportFile>,
}

impl Group {
    fn push(&mut self, file: ReportFile) {
        match file.side {
            Side::Unity => self.unity.push(file),
            Side::Blackbox => self.blackbox.push(file),
        }
    }

    fn stamps(&self) -> Vec<(PathBuf, Stamp)> {
        self.unity
            .iter()
            .chain(&self.blackbox)
            .map(|f| (f.path.clone(), f.stamp.clone()))
            .collect()
    }
}

struct Measured {
    stamps: Vec<(PathBuf, Stamp)>,
    coverage: SourceCoverage,
}

/// Scanner with a memo of previous work. Repeated `scan` calls re-read only
/// reports whose mtime or size changed; `scan_fresh` ignores the memo. Both
/// give the same result for the same files.
pub struct Scanner<'a> {
    rules: &'a IgnoreRuleSet,
    strategy: Strategy,
    pool: Option<ThreadPool>,
    interrupt: Option<Arc<AtomicBool>>,
    resolved: HashMap<PathBuf, (Stamp, Option<SourcePath>)>,
    measured: HashMap<SourcePath, Measured>,
}

impl<'a> Scanner<'a> {
    pub fn new(rules: &'a IgnoreRuleSet) -> Self {
        Self {
            rules,
            strategy: Strategy::Union,
            pool: None,
            interrupt: None,
            resolved: HashMap::new(),
            measured: HashMap::new(),
        }
    }

    /// Use a different combine strategy (diagnostics only).
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self.measured.clear();
        self
    }

    /// Worker count. Defaults to one per available core. The pool is built
    /// here once and reused by every scan.
    pub fn jobs(mut self, jobs: usize) -> Self {
        let jobs = jobs.max(1);
        self.pool = match ThreadPoolBuilder::new().num_threads(jobs).build() {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!("could not build a {jobs}-thread pool, using the global one: {e}");
                None
            }
        };
        self
    }

    /// Threads the scan runs on.
    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, ThreadPool::current_num_threads)
    }

    /// Stop scheduling new files once `flag` is set. Files already being
    /// read finish; the scan then returns `CovError::Interrupted`.
    pub fn interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Drop everything remembered from earlier scans.
    pub fn forget(&mut self) {
        self.resolved.clear();
        self.measured.clear();
    }

    pub fn scan_fresh(&mut self, roots: &BuildRoots) -> Result<CoverageReport> {
        self.forget();
        self.scan(roots)
    }

    pub fn scan(&mut self, roots: &BuildRoots) -> Result<CoverageReport> {
        let mut files = discover(&roots.unity, Side::Unity);
        let unity_reports = files.len();
        files.extend(discover(&roots.blackbox, Side::Blackbox));
        let blackbox_reports = files.len() - unity_reports;
        let prefixes = roots.prefixes();
        let project_name = roots.project_name();

        let resolved = self.resolve_all(files, &prefixes, project_name.as_deref())?;

        self.resolved = resolved
            .iter()
            .map(|(f, p)| (f.path.clone(), (f.stamp.clone(), p.clone())))
            .collect();

        let mut groups: BTreeMap<SourcePath, Group> = BTreeMap::new();
        for (file, path) in resolved {
            let Some(path) = path else {
                tracing::debug!(report = %file.path.display(), "no project source, skipping");
                continue;
            };
            if path.is_test_source() || self.rules.matches(&path) {
                tracing::trace!(%path, "excluded");
                continue;
            }
            groups.entry(path).or_default().push(file);
        }

        let measured = self.measure_all(groups)?;

        let mut report = CoverageReport::new();
        let mut memo = HashMap::with_capacity(measured.len());
        for (path, stamps, coverage) in measured {
            report.insert(path.clone(), coverage);
            memo.insert(path, Measured { stamps, coverage });
        }
        self.measured = memo;

        tracing::info!(
            unity_reports,
            blackbox_reports,
            sources = report.len(),
            strategy = %self.strategy,
            "scan complete"
        );
        Ok(report)
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupted() {
            tracing::warn!("scan interrupted");
            return Err(CovError::Interrupted);
        }
        Ok(())
    }

    fn run<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    fn resolve_all(
        &self,
        files: Vec<ReportFile>,
        prefixes: &[PathBuf],
        project_name: Option<&str>,
    ) -> Result<Vec<(ReportFile, Option<SourcePath>)>> {
        let prefixes: Vec<&Path> = prefixes.iter().map(PathBuf::as_path).collect();
        let resolved = self.run(|| {
            files
                .into_par_iter()
                .map(|file| {
                    if self.interrupted() {
                        return (file, None);
                    }
                    if let Some((stamp, path)) = self.resolved.get(&file.path) {
                        if *stamp == file.stamp {
                            let path = path.clone();
                            return (file, path);
                        }
                    }
                    let path = resolve(&file, &prefixes, project_name);
                    (file, path)
                })
                .collect()
        });
        self.check_interrupt()?;
        Ok(resolved)
    }

    fn measure_all(
        &self,
        groups: BTreeMap<SourcePath, Group>,
    ) -> Result<Vec<(SourcePath, Vec<(PathBuf, Stamp)>, SourceCoverage)>> {
        let measured = self.run(|| {
            groups
                .into_par_iter()
                .filter_map(|(path, group)| {
                    if self.interrupted() {
                        return None;
                    }
                    let stamps = group.stamps();
                    if let Some(prev) = self.measured.get(&path) {
                        if prev.stamps == stamps {
                            return Some((path, stamps, prev.coverage));
                        }
                    }
                    let coverage = self
                        .strategy
                        .evaluate(&read_side(&group.unity), &read_side(&group.blackbox));
                    Some((path, stamps, coverage))
                })
                .collect()
        });
        self.check_interrupt()?;
        Ok(measured)
    }
}

/// Map a report to its source: the `Source:` header when present, the
/// report's own location otherwise.
fn resolve(file: &ReportFile, prefixes: &[&Path], project_name: Option<&str>) -> Option<SourcePath> {
    match gcov::read_source_header(&file.path) {
        Ok(Some(header)) => SourcePath::from_header(&header, prefixes, project_name),
        Ok(None) => SourcePath::from_report_location(&file.relative),
        Err(e) => {
            tracing::warn!(report = %file.path.display(), "cannot read report header: {e}");
            SourcePath::from_report_location(&file.relative)
        }
    }
}

/// Report texts for one side of a group. Unreadable reports contribute
/// nothing.
fn read_side(files: &[ReportFile]) -> Vec<String> {
    files
        .iter()
        .filter_map(|f| match gcov::read_report(&f.path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(report = %f.path.display(), "cannot read report: {e}");
                None
            }
        })
        .collect()
}
