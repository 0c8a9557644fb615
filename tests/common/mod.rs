#![allow(dead_code)]

use std::path::Path;

use covunion::scan::BuildRoots;
use tempfile::TempDir;

/// Create a temporary project with `build/unity` and `build/blackbox` as
/// build roots. The roots are not created; writing a report creates them.
/// The caller must hold onto `TempDir` to keep the directory alive.
pub fn setup_tree() -> (TempDir, BuildRoots) {
    let dir = tempfile::tempdir().unwrap();
    let roots = BuildRoots::new(
        dir.path().join("build/unity"),
        dir.path().join("build/blackbox"),
    )
    .with_project_root(dir.path());
    (dir, roots)
}

/// Write a report at `rel` under `root`, creating directories as needed.
pub fn write_report(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Render a gcov text report. `Some(0)` is an unexecuted line, `Some(n)`
/// an executed one, `None` a line without code.
pub fn gcov(source: &str, lines: &[(u32, Option<u64>)]) -> String {
    let mut out = format!("        -:    0:Source:{source}\n        -:    0:Runs:1\n");
    for (number, count) in lines {
        let count = match count {
            None => "-".to_string(),
            Some(0) => "#####".to_string(),
            Some(n) => n.to_string(),
        };
        out.push_str(&format!("{count:>9}:{number:>5}:line {number}\n"));
    }
    out
}

/// Shorthand for a report where `covered` lines ran once and the rest of
/// `instrumented` never ran.
pub fn report(source: &str, instrumented: &[u32], covered: &[u32]) -> String {
    let lines: Vec<(u32, Option<u64>)> = instrumented
        .iter()
        .map(|&n| (n, Some(u64::from(covered.contains(&n)))))
        .collect();
    gcov(source, &lines)
}
