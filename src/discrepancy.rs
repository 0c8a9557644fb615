//! Side-by-side comparison of coverage calculation methods.
//!
//! Production figures always come from [`Strategy::Union`]. The other
//! strategies reproduce historical ways of counting combined coverage so
//! their output can be diffed against the union and the drift bounded.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::combine::combine;
use crate::error::CovError;
use crate::gcov;
use crate::model::{CoverageReport, CoverageSet, SourceCoverage};
use crate::source_path::SourcePath;

/// How the combined figures of a source file are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Exact set union over line numbers.
    #[default]
    Union,
    /// Both sides' reports concatenated and deduplicated by line number;
    /// the record read last decides whether a line counts as covered.
    Concatenate,
    /// Per-side counts added together with no deduplication.
    PerFileSum,
    /// The larger of the two per-side counts.
    MaxCount,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Union => "union",
            Strategy::Concatenate => "concatenate",
            Strategy::PerFileSum => "per-file-sum",
            Strategy::MaxCount => "max-count",
        }
    }

    /// Compute one source file's figures from the raw report texts of each
    /// side. A side with no texts is absent. The unity and blackbox slots
    /// are the same under every strategy; only the combined slot differs.
    pub fn evaluate(&self, unity: &[String], blackbox: &[String]) -> SourceCoverage {
        let unity_set = side_set(unity);
        let blackbox_set = side_set(blackbox);
        let mut coverage = combine(unity_set.as_ref(), blackbox_set.as_ref());
        if unity_set.is_none() || blackbox_set.is_none() {
            return coverage;
        }

        match self {
            Strategy::Union => {}
            Strategy::Concatenate => {
                let mut last: BTreeMap<u32, bool> = BTreeMap::new();
                for text in unity.iter().chain(blackbox) {
                    for record in gcov::records(text) {
                        last.insert(record.line_number, record.covered);
                    }
                }
                coverage.combined_instrumented = last.len() as u64;
                coverage.combined_covered = last.values().filter(|&&c| c).count() as u64;
            }
            Strategy::PerFileSum => {
                coverage.combined_instrumented =
                    coverage.unity_instrumented + coverage.blackbox_instrumented;
                coverage.combined_covered = coverage.unity_covered + coverage.blackbox_covered;
            }
            Strategy::MaxCount => {
                coverage.combined_instrumented = coverage
                    .unity_instrumented
                    .max(coverage.blackbox_instrumented);
                coverage.combined_covered = coverage.unity_covered.max(coverage.blackbox_covered);
            }
        }
        coverage
    }
}

fn side_set(texts: &[String]) -> Option<CoverageSet> {
    let mut iter = texts.iter().map(|t| gcov::parse(t));
    let mut set = iter.next()?;
    for other in iter {
        set.absorb(other);
    }
    Some(set)
}

impl std::str::FromStr for Strategy {
    type Err = CovError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "union" => Ok(Strategy::Union),
            "concatenate" => Ok(Strategy::Concatenate),
            "per-file-sum" => Ok(Strategy::PerFileSum),
            "max-count" => Ok(Strategy::MaxCount),
            _ => Err(CovError::Other(format!(
                "Unknown strategy: '{s}'. Supported: union, concatenate, per-file-sum, max-count"
            ))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source whose combined covered-line count differs between two reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub path: SourcePath,
    pub covered_a: u64,
    pub covered_b: u64,
    pub instrumented_a: u64,
    pub instrumented_b: u64,
}

impl Discrepancy {
    /// `covered_b - covered_a`.
    #[must_use]
    pub fn delta(&self) -> i64 {
        self.covered_b as i64 - self.covered_a as i64
    }
}

/// List every source whose combined covered count differs between `a` and
/// `b`, ordered by path. A source present in only one report is compared
/// against zero.
pub fn diff(a: &CoverageReport, b: &CoverageReport) -> Vec<Discrepancy> {
    let paths: BTreeSet<&SourcePath> = a.paths().chain(b.paths()).collect();
    paths
        .into_iter()
        .filter_map(|path| {
            let left = a.get(path.as_str()).copied().unwrap_or_default();
            let right = b.get(path.as_str()).copied().unwrap_or_default();
            (left.combined_covered != right.combined_covered).then(|| Discrepancy {
                path: path.clone(),
                covered_a: left.combined_covered,
                covered_b: right.combined_covered,
                instrumented_a: left.combined_instrumented,
                instrumented_b: right.combined_instrumented,
            })
        })
        .collect()
}

/// Net effect of a set of discrepancies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriftSummary {
    pub files: usize,
    pub net_delta: i64,
    pub max_abs_delta: u64,
}

pub fn summarize(discrepancies: &[Discrepancy]) -> DriftSummary {
    DriftSummary {
        files: discrepancies.len(),
        net_delta: discrepancies.iter().map(Discrepancy::delta).sum(),
        max_abs_delta: discrepancies
            .iter()
            .map(|d| d.delta().unsigned_abs())
            .max()
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITY: &str = "\
        -:    0:Source:src/a.c
        2:    1:a
    #####:    2:b
        1:    3:c
";
    const BLACKBOX: &str = "\
        -:    0:Source:src/a.c
    #####:    1:a
        4:    2:b
    #####:    3:c
    #####:    4:d
";

    fn texts(s: &str) -> Vec<String> {
        vec![s.to_string()]
    }

    fn sp(s: &str) -> SourcePath {
        SourcePath::new(s).unwrap()
    }

    #[test]
    fn test_union() {
        let c = Strategy::Union.evaluate(&texts(UNITY), &texts(BLACKBOX));
        assert_eq!((c.unity_instrumented, c.unity_covered), (3, 2));
        assert_eq!((c.blackbox_instrumented, c.blackbox_covered), (4, 1));
        assert_eq!((c.combined_instrumented, c.combined_covered), (4, 3));
    }

    #[test]
    fn test_concatenate_last_record_wins() {
        let c = Strategy::Concatenate.evaluate(&texts(UNITY), &texts(BLACKBOX));
        // Lines 1 and 3 were covered by unity but the blackbox records
        // come later and mark them unexecuted.
        assert_eq!((c.combined_instrumented, c.combined_covered), (4, 1));
        assert_eq!(c.unity(), Strategy::Union.evaluate(&texts(UNITY), &[]).unity());
    }

    #[test]
    fn test_per_file_sum_and_max() {
        let sum = Strategy::PerFileSum.evaluate(&texts(UNITY), &texts(BLACKBOX));
        assert_eq!((sum.combined_instrumented, sum.combined_covered), (7, 3));
        let max = Strategy::MaxCount.evaluate(&texts(UNITY), &texts(BLACKBOX));
        assert_eq!((max.combined_instrumented, max.combined_covered), (4, 2));
    }

    #[test]
    fn test_single_side_agrees_across_strategies() {
        let expected = Strategy::Union.evaluate(&texts(UNITY), &[]);
        for strategy in [
            Strategy::Concatenate,
            Strategy::PerFileSum,
            Strategy::MaxCount,
        ] {
            assert_eq!(strategy.evaluate(&texts(UNITY), &[]), expected);
            assert_eq!(
                strategy.evaluate(&[], &texts(UNITY)),
                expected.swapped()
            );
        }
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("per-file-sum".parse::<Strategy>().unwrap(), Strategy::PerFileSum);
        assert_eq!("UNION".parse::<Strategy>().unwrap(), Strategy::Union);
        assert!("median".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_diff_lists_only_changed_paths() {
        let mut a = CoverageReport::new();
        let mut b = CoverageReport::new();
        let cov = |covered| SourceCoverage {
            combined_instrumented: 10,
            combined_covered: covered,
            ..Default::default()
        };
        a.insert(sp("src/same.c"), cov(5));
        b.insert(sp("src/same.c"), cov(5));
        a.insert(sp("src/drift.c"), cov(5));
        b.insert(sp("src/drift.c"), cov(3));
        b.insert(sp("src/new.c"), cov(2));

        let d = diff(&a, &b);
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].path.as_str(), "src/drift.c");
        assert_eq!(d[0].delta(), -2);
        assert_eq!(d[1].path.as_str(), "src/new.c");
        assert_eq!(d[1].covered_a, 0);
        assert_eq!(d[1].delta(), 2);

        let summary = summarize(&d);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.net_delta, 0);
        assert_eq!(summary.max_abs_delta, 2);
    }

    #[test]
    fn test_diff_empty() {
        assert!(diff(&CoverageReport::new(), &CoverageReport::new()).is_empty());
        assert_eq!(summarize(&[]), DriftSummary::default());
    }
}
