//! Uniform in-memory representation of gcov coverage, independent of which
//! build tree a report came from. The parser produces `CoverageSet`s, the
//! aggregator folds them into `SourceCoverage`, and the scanner collects
//! those into a `CoverageReport`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::source_path::SourcePath;

/// Compute a coverage rate, returning 0.0 when the total is zero.
#[must_use]
pub fn rate(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// Coverage percentage rounded to three decimals. Zero when nothing is
/// instrumented.
#[must_use]
pub fn percent(covered: u64, total: u64) -> f64 {
    (rate(covered, total) * 100_000.0).round() / 1000.0
}

/// One instrumented source line as read from a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRecord {
    pub line_number: u32,
    pub covered: bool,
}

/// Parsed content of a single report: which lines are instrumented and
/// which of those ran at least once. `covered` is always a subset of
/// `instrumented`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageSet {
    source: Option<String>,
    instrumented: BTreeSet<u32>,
    covered: BTreeSet<u32>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one line. A line seen more than once counts as covered if any
    /// occurrence was covered.
    pub fn record(&mut self, line: LineRecord) {
        self.instrumented.insert(line.line_number);
        if line.covered {
            self.covered.insert(line.line_number);
        }
    }

    pub fn set_source(&mut self, source: String) {
        self.source = Some(source);
    }

    /// The raw `Source:` header value, if the report carried one.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn instrumented(&self) -> &BTreeSet<u32> {
        &self.instrumented
    }

    pub fn covered(&self) -> &BTreeSet<u32> {
        &self.covered
    }

    #[must_use]
    pub fn instrumented_count(&self) -> u64 {
        self.instrumented.len() as u64
    }

    #[must_use]
    pub fn covered_count(&self) -> u64 {
        self.covered.len() as u64
    }

    /// Fold another report for the same source into this one.
    pub fn absorb(&mut self, other: CoverageSet) {
        if self.source.is_none() {
            self.source = other.source;
        }
        self.instrumented.extend(other.instrumented);
        self.covered.extend(other.covered);
    }
}

impl FromIterator<LineRecord> for CoverageSet {
    fn from_iter<I: IntoIterator<Item = LineRecord>>(iter: I) -> Self {
        let mut set = CoverageSet::new();
        for line in iter {
            set.record(line);
        }
        set
    }
}

/// An instrumented/covered pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub instrumented: u64,
    pub covered: u64,
}

impl Counts {
    #[must_use]
    pub fn rate(&self) -> f64 {
        rate(self.covered, self.instrumented)
    }

    #[must_use]
    pub fn percent(&self) -> f64 {
        percent(self.covered, self.instrumented)
    }
}

impl std::ops::AddAssign for Counts {
    fn add_assign(&mut self, rhs: Self) {
        self.instrumented += rhs.instrumented;
        self.covered += rhs.covered;
    }
}

/// Unity, blackbox and combined figures for one source file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCoverage {
    pub unity_instrumented: u64,
    pub unity_covered: u64,
    pub blackbox_instrumented: u64,
    pub blackbox_covered: u64,
    pub combined_instrumented: u64,
    pub combined_covered: u64,
}

impl SourceCoverage {
    #[must_use]
    pub fn unity(&self) -> Counts {
        Counts {
            instrumented: self.unity_instrumented,
            covered: self.unity_covered,
        }
    }

    #[must_use]
    pub fn blackbox(&self) -> Counts {
        Counts {
            instrumented: self.blackbox_instrumented,
            covered: self.blackbox_covered,
        }
    }

    #[must_use]
    pub fn combined(&self) -> Counts {
        Counts {
            instrumented: self.combined_instrumented,
            covered: self.combined_covered,
        }
    }

    /// The same figures with the unity and blackbox slots exchanged.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            unity_instrumented: self.blackbox_instrumented,
            unity_covered: self.blackbox_covered,
            blackbox_instrumented: self.unity_instrumented,
            blackbox_covered: self.unity_covered,
            ..*self
        }
    }
}

/// Flat record handed to downstream renderers; also the JSON shape of a
/// saved report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub path: SourcePath,
    pub combined_instrumented: u64,
    pub unity_instrumented: u64,
    pub blackbox_instrumented: u64,
    pub combined_covered: u64,
    pub unity_covered: u64,
    pub blackbox_covered: u64,
}

impl CoverageRecord {
    #[must_use]
    pub fn coverage(&self) -> SourceCoverage {
        SourceCoverage {
            unity_instrumented: self.unity_instrumented,
            unity_covered: self.unity_covered,
            blackbox_instrumented: self.blackbox_instrumented,
            blackbox_covered: self.blackbox_covered,
            combined_instrumented: self.combined_instrumented,
            combined_covered: self.combined_covered,
        }
    }
}

/// Per-source coverage for a whole scan. Built once, never updated; the
/// next scan produces a new report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<CoverageRecord>", from = "Vec<CoverageRecord>")]
pub struct CoverageReport {
    entries: BTreeMap<SourcePath, SourceCoverage>,
}

impl CoverageReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: SourcePath, coverage: SourceCoverage) {
        self.entries.insert(path, coverage);
    }

    pub fn get(&self, path: &str) -> Option<&SourceCoverage> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourcePath, &SourceCoverage)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &SourcePath> {
        self.entries.keys()
    }

    /// Entries ordered by directory, then file name.
    pub fn sorted_for_display(&self) -> Vec<(&SourcePath, &SourceCoverage)> {
        let mut rows: Vec<_> = self.entries.iter().collect();
        rows.sort_by(|a, b| a.0.display_key().cmp(&b.0.display_key()));
        rows
    }

    /// The report as a flat list of records.
    pub fn records(&self) -> Vec<CoverageRecord> {
        self.entries
            .iter()
            .map(|(path, c)| CoverageRecord {
                path: path.clone(),
                combined_instrumented: c.combined_instrumented,
                unity_instrumented: c.unity_instrumented,
                blackbox_instrumented: c.blackbox_instrumented,
                combined_covered: c.combined_covered,
                unity_covered: c.unity_covered,
                blackbox_covered: c.blackbox_covered,
            })
            .collect()
    }
}

impl FromIterator<(SourcePath, SourceCoverage)> for CoverageReport {
    fn from_iter<I: IntoIterator<Item = (SourcePath, SourceCoverage)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<CoverageReport> for Vec<CoverageRecord> {
    fn from(report: CoverageReport) -> Self {
        report.records()
    }
}

impl From<Vec<CoverageRecord>> for CoverageReport {
    fn from(records: Vec<CoverageRecord>) -> Self {
        records
            .into_iter()
            .map(|r| {
                let coverage = r.coverage();
                (r.path, coverage)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(s: &str) -> SourcePath {
        SourcePath::new(s).unwrap()
    }

    #[test]
    fn test_percent_zero_total() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(5, 0), 0.0);
    }

    #[test]
    fn test_percent_three_decimals() {
        assert_eq!(percent(1, 3), 33.333);
        assert_eq!(percent(2, 3), 66.667);
        assert_eq!(percent(50, 100), 50.0);
    }

    #[test]
    fn test_coverage_set_repeated_line_keeps_coverage() {
        let set: CoverageSet = [
            LineRecord { line_number: 4, covered: false },
            LineRecord { line_number: 4, covered: true },
            LineRecord { line_number: 7, covered: false },
        ]
        .into_iter()
        .collect();

        assert_eq!(set.instrumented_count(), 2);
        assert_eq!(set.covered_count(), 1);
        assert!(set.covered().contains(&4));
    }

    #[test]
    fn test_absorb_unions_lines() {
        let mut a: CoverageSet = [LineRecord { line_number: 1, covered: true }]
            .into_iter()
            .collect();
        let mut b: CoverageSet = [
            LineRecord { line_number: 1, covered: false },
            LineRecord { line_number: 2, covered: true },
        ]
        .into_iter()
        .collect();
        b.set_source("src/a.h".to_string());

        a.absorb(b);
        assert_eq!(a.instrumented_count(), 2);
        assert_eq!(a.covered_count(), 2);
        assert_eq!(a.source(), Some("src/a.h"));
    }

    #[test]
    fn test_swapped_keeps_combined() {
        let c = SourceCoverage {
            unity_instrumented: 3,
            unity_covered: 2,
            combined_instrumented: 3,
            combined_covered: 2,
            ..Default::default()
        };
        let s = c.swapped();
        assert_eq!(s.blackbox(), c.unity());
        assert_eq!(s.unity(), Counts::default());
        assert_eq!(s.combined(), c.combined());
    }

    #[test]
    fn test_report_json_is_record_list() {
        let mut report = CoverageReport::new();
        report.insert(
            sp("src/a.c"),
            SourceCoverage {
                unity_instrumented: 2,
                unity_covered: 1,
                combined_instrumented: 2,
                combined_covered: 1,
                ..Default::default()
            },
        );

        let json = serde_json::to_value(&report).unwrap();
        let first = &json.as_array().unwrap()[0];
        assert_eq!(first["path"], "src/a.c");
        assert_eq!(first["unity_covered"], 1);
        assert_eq!(first["blackbox_instrumented"], 0);

        let back: CoverageReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_sorted_for_display_groups_directories() {
        let report: CoverageReport = [
            (sp("src/zeta.c"), SourceCoverage::default()),
            (sp("src/net/b.c"), SourceCoverage::default()),
            (sp("src/net/a.c"), SourceCoverage::default()),
            (sp("src/alpha.c"), SourceCoverage::default()),
        ]
        .into_iter()
        .collect();

        let order: Vec<&str> = report
            .sorted_for_display()
            .iter()
            .map(|(p, _)| p.as_str())
            .collect();
        assert_eq!(
            order,
            vec!["src/alpha.c", "src/zeta.c", "src/net/a.c", "src/net/b.c"]
        );
    }
}
