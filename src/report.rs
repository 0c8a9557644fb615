//! Totals and output formatting for coverage reports.

use std::fmt::Write;

use serde::Serialize;

use crate::discrepancy::{summarize, Discrepancy};
use crate::model::{CoverageRecord, CoverageReport, Counts};

/// Aggregate figures across every source in a report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub files: usize,
    pub unity: Counts,
    pub blackbox: Counts,
    pub combined: Counts,
}

impl Totals {
    #[must_use]
    pub fn unity_pct(&self) -> f64 {
        self.unity.percent()
    }

    #[must_use]
    pub fn blackbox_pct(&self) -> f64 {
        self.blackbox.percent()
    }

    #[must_use]
    pub fn combined_pct(&self) -> f64 {
        self.combined.percent()
    }
}

/// Sum instrumented and covered lines per figure.
pub fn totals(report: &CoverageReport) -> Totals {
    let mut t = Totals {
        files: report.len(),
        ..Default::default()
    };
    for (_, c) in report.iter() {
        t.unity += c.unity();
        t.blackbox += c.blackbox();
        t.combined += c.combined();
    }
    t
}

/// Trait for rendering a report with its totals.
pub trait ReportFormatter {
    fn format(&self, report: &CoverageReport, totals: &Totals) -> String;
}

/// Plain text table.
pub struct TextFormatter {
    /// Worst combined coverage first instead of directory order.
    pub sort_by_coverage: bool,
}

fn cell(c: Counts) -> String {
    format!("{}/{} {:>8.3}%", c.covered, c.instrumented, c.percent())
}

impl ReportFormatter for TextFormatter {
    fn format(&self, report: &CoverageReport, totals: &Totals) -> String {
        let mut out = String::new();
        if report.is_empty() {
            out.push_str("No coverage data found.\n");
            return out;
        }

        let mut rows = report.sorted_for_display();
        if self.sort_by_coverage {
            rows.sort_by(|a, b| a.1.combined().rate().total_cmp(&b.1.combined().rate()));
        }

        writeln!(
            out,
            "{:<50} {:>20} {:>20} {:>20}",
            "FILE", "UNITY", "BLACKBOX", "COMBINED"
        )
        .unwrap();
        writeln!(out, "{}", "-".repeat(113)).unwrap();
        for (path, c) in rows {
            writeln!(
                out,
                "{:<50} {:>20} {:>20} {:>20}",
                path.as_str(),
                cell(c.unity()),
                cell(c.blackbox()),
                cell(c.combined())
            )
            .unwrap();
        }
        writeln!(out, "{}", "-".repeat(113)).unwrap();
        writeln!(
            out,
            "{:<50} {:>20} {:>20} {:>20}",
            format!("TOTAL ({} files)", totals.files),
            cell(totals.unity),
            cell(totals.blackbox),
            cell(totals.combined)
        )
        .unwrap();
        out
    }
}

/// JSON document with totals and the per-file records.
pub struct JsonFormatter;

#[derive(Serialize)]
struct CountsView {
    instrumented: u64,
    covered: u64,
    percent: f64,
}

impl From<Counts> for CountsView {
    fn from(c: Counts) -> Self {
        Self {
            instrumented: c.instrumented,
            covered: c.covered,
            percent: c.percent(),
        }
    }
}

#[derive(Serialize)]
struct TotalsView {
    files: usize,
    unity: CountsView,
    blackbox: CountsView,
    combined: CountsView,
}

#[derive(Serialize)]
struct JsonReport {
    totals: TotalsView,
    files: Vec<CoverageRecord>,
}

impl ReportFormatter for JsonFormatter {
    fn format(&self, report: &CoverageReport, totals: &Totals) -> String {
        let doc = JsonReport {
            totals: TotalsView {
                files: totals.files,
                unity: totals.unity.into(),
                blackbox: totals.blackbox.into(),
                combined: totals.combined.into(),
            },
            files: report.records(),
        };
        let mut out = serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".to_string());
        out.push('\n');
        out
    }
}

/// Text listing of discrepancies between two calculation methods.
pub fn format_discrepancies(label_a: &str, label_b: &str, discrepancies: &[Discrepancy]) -> String {
    let mut out = String::new();
    if discrepancies.is_empty() {
        writeln!(out, "No discrepancies between {label_a} and {label_b}.").unwrap();
        return out;
    }

    writeln!(
        out,
        "{:<50} {:>14} {:>14} {:>8}",
        "FILE", label_a, label_b, "DELTA"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(89)).unwrap();
    for d in discrepancies {
        writeln!(
            out,
            "{:<50} {:>14} {:>14} {:>+8}",
            d.path.as_str(),
            format!("{}/{}", d.covered_a, d.instrumented_a),
            format!("{}/{}", d.covered_b, d.instrumented_b),
            d.delta()
        )
        .unwrap();
    }

    let summary = summarize(discrepancies);
    writeln!(
        out,
        "\n{} files differ; net {:+} covered lines, largest single-file drift {}",
        summary.files, summary.net_delta, summary.max_abs_delta
    )
    .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceCoverage;
    use crate::source_path::SourcePath;

    fn sp(s: &str) -> SourcePath {
        SourcePath::new(s).unwrap()
    }

    fn sample() -> CoverageReport {
        let mut report = CoverageReport::new();
        report.insert(
            sp("src/a.c"),
            SourceCoverage {
                unity_instrumented: 100,
                unity_covered: 40,
                blackbox_instrumented: 100,
                blackbox_covered: 30,
                combined_instrumented: 100,
                combined_covered: 50,
            },
        );
        report.insert(sp("src/b.c"), SourceCoverage::default());
        report
    }

    #[test]
    fn test_totals() {
        let t = totals(&sample());
        assert_eq!(t.files, 2);
        assert_eq!(t.combined_pct(), 50.0);
        assert_eq!(t.unity_pct(), 40.0);
        assert_eq!(t.blackbox_pct(), 30.0);
    }

    #[test]
    fn test_totals_empty_is_zero() {
        let t = totals(&CoverageReport::new());
        assert_eq!(t.files, 0);
        assert_eq!(t.unity_pct(), 0.0);
        assert_eq!(t.blackbox_pct(), 0.0);
        assert_eq!(t.combined_pct(), 0.0);
    }

    #[test]
    fn test_totals_all_uninstrumented() {
        let mut report = CoverageReport::new();
        report.insert(sp("src/empty.c"), SourceCoverage::default());
        assert_eq!(totals(&report).combined_pct(), 0.0);
    }

    #[test]
    fn test_text_formatter() {
        let report = sample();
        let out = TextFormatter {
            sort_by_coverage: false,
        }
        .format(&report, &totals(&report));
        assert!(out.contains("COMBINED"));
        assert!(out.contains("src/a.c"));
        assert!(out.contains("50/100   50.000%"));
        assert!(out.contains("TOTAL (2 files)"));
    }

    #[test]
    fn test_text_formatter_sort_by_coverage() {
        let report = sample();
        let out = TextFormatter {
            sort_by_coverage: true,
        }
        .format(&report, &totals(&report));
        assert!(out.find("src/b.c").unwrap() < out.find("src/a.c").unwrap());
    }

    #[test]
    fn test_text_formatter_empty() {
        let report = CoverageReport::new();
        let out = TextFormatter {
            sort_by_coverage: false,
        }
        .format(&report, &totals(&report));
        assert_eq!(out, "No coverage data found.\n");
    }

    #[test]
    fn test_json_formatter() {
        let report = sample();
        let out = JsonFormatter.format(&report, &totals(&report));
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["totals"]["combined"]["percent"], 50.0);
        assert_eq!(value["files"][0]["path"], "src/a.c");
        assert_eq!(value["files"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_format_discrepancies() {
        let d = vec![Discrepancy {
            path: sp("src/a.c"),
            covered_a: 5,
            covered_b: 3,
            instrumented_a: 10,
            instrumented_b: 10,
        }];
        let out = format_discrepancies("union", "concatenate", &d);
        assert!(out.contains("src/a.c"));
        assert!(out.contains("-2"));
        assert!(out.contains("1 files differ"));

        let none = format_discrepancies("union", "max-count", &[]);
        assert!(none.contains("No discrepancies"));
    }
}
