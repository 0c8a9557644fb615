//! Union of the unity and blackbox views of one source file.

use crate::model::{CoverageSet, SourceCoverage};

/// Combine the two sides of a source file.
///
/// With one side absent the present side fills both its own slot and the
/// combined slot. With both present the combined figures are exact set
/// unions over line numbers: the builds may disagree on which lines are
/// instrumented, so neither counts nor their max are enough.
#[must_use]
pub fn combine(unity: Option<&CoverageSet>, blackbox: Option<&CoverageSet>) -> SourceCoverage {
    match (unity, blackbox) {
        (None, None) => SourceCoverage::default(),
        (Some(u), None) => SourceCoverage {
            unity_instrumented: u.instrumented_count(),
            unity_covered: u.covered_count(),
            combined_instrumented: u.instrumented_count(),
            combined_covered: u.covered_count(),
            ..Default::default()
        },
        (None, Some(b)) => SourceCoverage {
            blackbox_instrumented: b.instrumented_count(),
            blackbox_covered: b.covered_count(),
            combined_instrumented: b.instrumented_count(),
            combined_covered: b.covered_count(),
            ..Default::default()
        },
        (Some(u), Some(b)) => SourceCoverage {
            unity_instrumented: u.instrumented_count(),
            unity_covered: u.covered_count(),
            blackbox_instrumented: b.instrumented_count(),
            blackbox_covered: b.covered_count(),
            combined_instrumented: u.instrumented().union(b.instrumented()).count() as u64,
            combined_covered: u.covered().union(b.covered()).count() as u64,
        },
    }
}
