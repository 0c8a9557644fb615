//! Parser for the gcov text report format.
//!
//! Every line is `<count>:<line number>:<source text>` with the first two
//! fields right-aligned:
//!
//!   "        -:    0:Source:src/net/socket.c"
//!   "        5:   12:    int fd = -1;"
//!   "    #####:   13:    close(fd);"
//!   "        -:   14:}"
//!
//! A positive count (optionally followed by `*`) marks a covered line,
//! `#####` an instrumented line that never ran, and `-` a line with no code.
//! Line 0 carries header fields, of which only `Source:` is used. Function,
//! call and branch summaries have a different shape and are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;
use crate::model::{CoverageSet, LineRecord};

/// Header lines before the first numbered source line, with some slack for
/// toolchains that emit extra metadata.
const MAX_HEADER_LINES: usize = 32;

static LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([^:\s]+)\s*:\s*(\d+):(.*)$").unwrap());

enum Entry<'a> {
    Header(&'a str),
    Line(LineRecord),
    Skip,
}

fn classify(line: &str) -> Entry<'_> {
    let Some(caps) = LINE_RE.captures(line) else {
        return Entry::Skip;
    };
    let (Some(count), Some(number), Some(rest)) = (caps.get(1), caps.get(2), caps.get(3)) else {
        return Entry::Skip;
    };
    let Ok(line_number) = number.as_str().parse::<u32>() else {
        return Entry::Skip;
    };

    if line_number == 0 {
        return Entry::Header(rest.as_str());
    }

    match count.as_str() {
        "#####" => Entry::Line(LineRecord {
            line_number,
            covered: false,
        }),
        count => match count.trim_end_matches('*').parse::<u64>() {
            Ok(n) if n > 0 => Entry::Line(LineRecord {
                line_number,
                covered: true,
            }),
            _ => Entry::Skip,
        },
    }
}

/// Every instrumented line in report order, duplicates included.
pub fn records(text: &str) -> impl Iterator<Item = LineRecord> + '_ {
    text.lines().filter_map(|line| match classify(line) {
        Entry::Line(record) => Some(record),
        _ => None,
    })
}

/// The `Source:` header value, if present.
pub fn source_header(text: &str) -> Option<&str> {
    text.lines().find_map(|line| match classify(line) {
        Entry::Header(rest) => rest.strip_prefix("Source:").map(str::trim),
        _ => None,
    })
}

/// Parse a report into the set of instrumented and covered lines.
pub fn parse(text: &str) -> CoverageSet {
    let mut set = CoverageSet::new();
    for line in text.lines() {
        match classify(line) {
            Entry::Header(rest) => {
                if let Some(source) = rest.strip_prefix("Source:") {
                    set.set_source(source.trim().to_string());
                }
            }
            Entry::Line(record) => set.record(record),
            Entry::Skip => {}
        }
    }
    set
}

/// Read a report from disk. Invalid UTF-8 in the embedded source text is
/// replaced rather than rejected.
pub fn read_report(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Read just enough of a report to find its `Source:` header.
pub fn read_source_header(path: &Path) -> Result<Option<String>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();

    for _ in 0..MAX_HEADER_LINES {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        match classify(line.trim_end()) {
            Entry::Header(rest) => {
                if let Some(source) = rest.strip_prefix("Source:") {
                    return Ok(Some(source.trim().to_string()));
                }
            }
            Entry::Line(_) => break,
            Entry::Skip => {}
        }
    }
    Ok(None)
}
