//! Command handler functions for the covunion CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use serde::Serialize;

use crate::cache::{CacheKey, Inventory, ResultCache};
use crate::discrepancy::{self, Discrepancy, DriftSummary, Strategy};
use crate::ignore::IgnoreRuleSet;
use crate::model::CoverageReport;
use crate::report::{self, JsonFormatter, ReportFormatter, TextFormatter, Totals};
use crate::scan::{self, BuildRoots, Scanner};

/// Output style for report commands.
#[derive(Clone, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Everything a command needs that outlives a single scan: the ignore
/// rules (loaded once), the result cache and the worker settings.
pub struct Context {
    pub rules: IgnoreRuleSet,
    pub cache: ResultCache,
    pub jobs: Option<usize>,
    pub interrupt: Arc<AtomicBool>,
}

impl Context {
    pub fn new(rules: IgnoreRuleSet, cache: ResultCache) -> Self {
        Self {
            rules,
            cache,
            jobs: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn scanner<'a>(
    rules: &'a IgnoreRuleSet,
    jobs: Option<usize>,
    interrupt: &Arc<AtomicBool>,
) -> Scanner<'a> {
    let scanner = Scanner::new(rules).interrupt(Arc::clone(interrupt));
    match jobs {
        Some(n) => scanner.jobs(n),
        None => scanner,
    }
}

/// Result of the `scan` command.
pub struct ScanOutcome {
    pub output: String,
    pub totals: Totals,
}

/// Scan both trees (through the result cache) and render the report.
pub fn cmd_scan(
    ctx: &mut Context,
    roots: &BuildRoots,
    format: &OutputFormat,
    sort_by_coverage: bool,
) -> Result<ScanOutcome> {
    let key = CacheKey {
        fingerprint: ctx.rules.fingerprint(),
        scope: roots.scope(),
    };
    let current = if ctx.cache.is_enabled() {
        scan::inventory(roots)
    } else {
        Inventory::default()
    };

    let mut scanner = scanner(&ctx.rules, ctx.jobs, &ctx.interrupt);
    let report = ctx
        .cache
        .get_or_compute(&key, &current, || scanner.scan(roots))
        .context("Coverage scan failed")?;

    let totals = report::totals(&report);
    let output = match format {
        OutputFormat::Text => TextFormatter { sort_by_coverage }.format(&report, &totals),
        OutputFormat::Json => JsonFormatter.format(&report, &totals),
    };
    Ok(ScanOutcome { output, totals })
}

/// Fail when combined coverage is below `min_pct`.
pub fn check_threshold(totals: &Totals, min_pct: f64) -> Result<()> {
    let actual = totals.combined_pct();
    if actual < min_pct {
        anyhow::bail!("Combined coverage {actual:.3}% is below the required {min_pct:.3}%");
    }
    Ok(())
}

#[derive(Serialize)]
struct DiffDocument<'a> {
    method_a: &'a str,
    method_b: &'a str,
    summary: DriftSummary,
    discrepancies: &'a [Discrepancy],
}

fn render_diff(
    label_a: &str,
    label_b: &str,
    discrepancies: &[Discrepancy],
    format: &OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(report::format_discrepancies(
            label_a,
            label_b,
            discrepancies,
        )),
        OutputFormat::Json => {
            let doc = DiffDocument {
                method_a: label_a,
                method_b: label_b,
                summary: discrepancy::summarize(discrepancies),
                discrepancies,
            };
            let mut out = serde_json::to_string_pretty(&doc)?;
            out.push('\n');
            Ok(out)
        }
    }
}

/// Scan with the union strategy and with `against`, then list every source
/// whose combined covered count differs. Never cached.
pub fn cmd_diff(
    ctx: &Context,
    roots: &BuildRoots,
    against: Strategy,
    format: &OutputFormat,
) -> Result<String> {
    let union = scanner(&ctx.rules, ctx.jobs, &ctx.interrupt)
        .scan(roots)
        .context("Union scan failed")?;
    let legacy = scanner(&ctx.rules, ctx.jobs, &ctx.interrupt)
        .strategy(against)
        .scan(roots)
        .with_context(|| format!("{against} scan failed"))?;

    let discrepancies = discrepancy::diff(&union, &legacy);
    render_diff(Strategy::Union.as_str(), against.as_str(), &discrepancies, format)
}

fn load_report(path: &Path) -> Result<CoverageReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse report {}", path.display()))
}

/// Diff two reports previously saved as JSON record lists.
pub fn cmd_compare(a: &Path, b: &Path, format: &OutputFormat) -> Result<String> {
    let report_a = load_report(a)?;
    let report_b = load_report(b)?;
    let discrepancies = discrepancy::diff(&report_a, &report_b);
    render_diff(
        &a.display().to_string(),
        &b.display().to_string(),
        &discrepancies,
        format,
    )
}

pub fn cmd_clear_cache(ctx: &mut Context) -> Result<String> {
    if !ctx.cache.is_enabled() {
        return Ok("Result cache is disabled.\n".to_string());
    }
    let removed = ctx.cache.clear().context("Failed to clear result cache")?;
    let mut out = String::new();
    writeln!(out, "Removed {removed} cached scans.").unwrap();
    Ok(out)
}

/// Default cache location for a project.
pub fn default_cache_path(project_root: &Path) -> PathBuf {
    project_root.join(".covunion.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    const UNITY_A: &str = "\
        -:    0:Source:src/a.c
        1:    1:a
        1:    2:b
    #####:    3:c
";
    const BLACKBOX_A: &str = "\
        -:    0:Source:src/a.c
    #####:    1:a
    #####:    2:b
        2:    3:c
";

    fn tree() -> (tempfile::TempDir, BuildRoots) {
        let dir = tempfile::tempdir().unwrap();
        let unity = dir.path().join("build/unity");
        let blackbox = dir.path().join("build/coverage");
        std::fs::create_dir_all(&unity).unwrap();
        std::fs::create_dir_all(&blackbox).unwrap();
        std::fs::write(unity.join("a.c.gcov"), UNITY_A).unwrap();
        std::fs::write(blackbox.join("a.c.gcov"), BLACKBOX_A).unwrap();
        let roots = BuildRoots::new(unity, blackbox).with_project_root(dir.path());
        (dir, roots)
    }

    fn ctx() -> Context {
        Context::new(IgnoreRuleSet::builtin(), ResultCache::in_memory())
    }

    #[test]
    fn test_cmd_scan_text() {
        let (_dir, roots) = tree();
        let mut ctx = ctx();
        let outcome = cmd_scan(&mut ctx, &roots, &OutputFormat::Text, false).unwrap();
        assert!(outcome.output.contains("src/a.c"));
        assert!(outcome.output.contains("3/3  100.000%"));
        assert_eq!(outcome.totals.combined.covered, 3);
        assert_eq!(outcome.totals.unity.covered, 2);
    }

    #[test]
    fn test_cmd_scan_json() {
        let (_dir, roots) = tree();
        let mut ctx = ctx();
        let outcome = cmd_scan(&mut ctx, &roots, &OutputFormat::Json, false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(value["files"][0]["combined_covered"], 3);
        assert_eq!(value["totals"]["blackbox"]["covered"], 1);
    }

    #[test]
    fn test_cmd_scan_interrupted() {
        let (_dir, roots) = tree();
        let mut ctx = ctx();
        ctx.interrupt.store(true, Ordering::SeqCst);
        assert!(cmd_scan(&mut ctx, &roots, &OutputFormat::Text, false).is_err());
    }

    #[test]
    fn test_threshold_fails_once_reports_are_gone() {
        let (_dir, roots) = tree();
        let mut ctx = ctx();
        let before = cmd_scan(&mut ctx, &roots, &OutputFormat::Text, false).unwrap();
        assert!(check_threshold(&before.totals, 50.0).is_ok());

        std::fs::remove_dir_all(&roots.unity).unwrap();
        std::fs::remove_dir_all(&roots.blackbox).unwrap();
        let after = cmd_scan(&mut ctx, &roots, &OutputFormat::Text, false).unwrap();
        assert_eq!(after.totals.files, 0);
        assert_eq!(after.output, "No coverage data found.\n");
        assert!(check_threshold(&after.totals, 50.0).is_err());
    }

    #[test]
    fn test_check_threshold() {
        let (_dir, roots) = tree();
        let mut ctx = ctx();
        let outcome = cmd_scan(&mut ctx, &roots, &OutputFormat::Text, false).unwrap();
        assert!(check_threshold(&outcome.totals, 100.0).is_ok());

        let empty = report::totals(&CoverageReport::new());
        let err = check_threshold(&empty, 10.0).unwrap_err();
        assert!(err.to_string().contains("below the required"));
    }

    #[test]
    fn test_cmd_diff_against_concatenate() {
        let (_dir, roots) = tree();
        let ctx = ctx();
        let out = cmd_diff(&ctx, &roots, Strategy::Concatenate, &OutputFormat::Text).unwrap();
        // Concatenation lets the blackbox "#####" records hide unity hits.
        assert!(out.contains("src/a.c"));
        assert!(out.contains("-2"));
    }

    #[test]
    fn test_cmd_diff_json() {
        let (_dir, roots) = tree();
        let ctx = ctx();
        let out = cmd_diff(&ctx, &roots, Strategy::MaxCount, &OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["method_b"], "max-count");
        assert_eq!(value["summary"]["files"], 1);
        assert_eq!(value["discrepancies"][0]["covered_a"], 3);
        assert_eq!(value["discrepancies"][0]["covered_b"], 2);
    }

    #[test]
    fn test_cmd_compare() {
        let (dir, roots) = tree();
        let mut ctx = ctx();
        let a = cmd_scan(&mut ctx, &roots, &OutputFormat::Json, false).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&a.output).unwrap();
        let records = serde_json::to_string(&doc["files"]).unwrap();

        let path_a = dir.path().join("a.json");
        let path_b = dir.path().join("b.json");
        std::fs::write(&path_a, &records).unwrap();
        std::fs::write(&path_b, "[]").unwrap();

        let out = cmd_compare(&path_a, &path_b, &OutputFormat::Text).unwrap();
        assert!(out.contains("src/a.c"));
        assert!(out.contains("-3"));

        let same = cmd_compare(&path_a, &path_a, &OutputFormat::Text).unwrap();
        assert!(same.contains("No discrepancies"));
    }

    #[test]
    fn test_cmd_compare_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "not json").unwrap();
        assert!(cmd_compare(&bad, &bad, &OutputFormat::Text).is_err());
    }

    #[test]
    fn test_cmd_clear_cache() {
        let (_dir, roots) = tree();
        let mut ctx = ctx();
        cmd_scan(&mut ctx, &roots, &OutputFormat::Text, false).unwrap();
        let out = cmd_clear_cache(&mut ctx).unwrap();
        assert!(out.contains("Removed 1 cached scans."));

        let mut disabled = Context::new(IgnoreRuleSet::builtin(), ResultCache::disabled());
        assert!(cmd_clear_cache(&mut disabled).unwrap().contains("disabled"));
    }
}
