//! Result cache for batch scans, stored in SQLite.
//!
//! Entries are keyed by the ignore-rule fingerprint plus the scanned roots.
//! An entry is trusted while the set of reports on disk is the one it was
//! computed from (same count, same digest over paths and stamps) and no
//! report is newer than the moment its scan started. Every failure here (missing or corrupt file, locked
//! database, unwritable directory) is logged and treated as a miss: the
//! cache can make a scan faster but never makes it fail.

use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CovError, Result};
use crate::model::{CoverageReport, SourceCoverage};
use crate::source_path::SourcePath;

pub const SCHEMA_VERSION: u32 = 2;

const SCHEMA: &str = include_str!("../schema.sql");

/// How long a writer waits for another process holding the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one cached scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub fingerprint: String,
    pub scope: String,
}

/// The report files behind a scan, as seen on disk. Built by
/// [`crate::scan::inventory`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub reports: u64,
    pub digest: String,
    pub newest: Option<SystemTime>,
}

/// A cached scan as read back from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredScan {
    /// Scan start, in milliseconds since the epoch.
    pub created_at_ms: i64,
    pub reports: u64,
    pub digest: String,
    pub report: CoverageReport,
}

impl StoredScan {
    /// Is this entry still valid for the reports currently on disk?
    pub fn is_fresh(&self, current: &Inventory) -> bool {
        if self.reports != current.reports || self.digest != current.digest {
            tracing::debug!(
                cached = self.reports,
                on_disk = current.reports,
                "report set changed since cached scan"
            );
            return false;
        }
        if let Some(newest) = current.newest {
            let newest_ms = DateTime::<Utc>::from(newest).timestamp_millis();
            if newest_ms > self.created_at_ms {
                tracing::debug!(newest_ms, created_at_ms = self.created_at_ms, "cache entry is stale");
                return false;
            }
        }
        true
    }
}

/// Open (or create) the cache database at the given path.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

/// Ensure the schema is initialized. Safe to call on an already-initialized
/// DB. A cache written by an older schema is simply discarded.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) if v > SCHEMA_VERSION => {
            return Err(CovError::Other(format!(
                "Cache schema version {v} is newer than this binary supports ({SCHEMA_VERSION})."
            )));
        }
        Some(v) => {
            tracing::info!(from = v, to = SCHEMA_VERSION, "discarding cache from older schema");
            conn.execute_batch("DROP TABLE source_coverage; DROP TABLE scan;")?;
            conn.execute_batch(SCHEMA)?;
            conn.execute("UPDATE schema_version SET version = ?1", params![SCHEMA_VERSION])?;
        }
    }
    Ok(())
}

/// Load a cached scan.
pub fn read_entry(conn: &Connection, key: &CacheKey) -> Result<Option<StoredScan>> {
    let scan: Option<(i64, i64, u64, String)> = conn
        .query_row(
            "SELECT id, created_at_ms, report_count, report_digest
             FROM scan WHERE fingerprint = ?1 AND scope = ?2",
            params![key.fingerprint, key.scope],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let Some((scan_id, created_at_ms, reports, digest)) = scan else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT path, unity_instrumented, unity_covered, blackbox_instrumented,
                blackbox_covered, combined_instrumented, combined_covered
         FROM source_coverage WHERE scan_id = ?1",
    )?;
    let rows = stmt.query_map(params![scan_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            SourceCoverage {
                unity_instrumented: row.get(1)?,
                unity_covered: row.get(2)?,
                blackbox_instrumented: row.get(3)?,
                blackbox_covered: row.get(4)?,
                combined_instrumented: row.get(5)?,
                combined_covered: row.get(6)?,
            },
        ))
    })?;

    let mut report = CoverageReport::new();
    for row in rows {
        let (path, coverage) = row?;
        let path = SourcePath::new(&path)
            .ok_or_else(|| CovError::Other(format!("Invalid cached source path: '{path}'")))?;
        report.insert(path, coverage);
    }
    Ok(Some(StoredScan {
        created_at_ms,
        reports,
        digest,
        report,
    }))
}

/// Replace the entry for `key` in a single transaction.
pub fn write_entry(
    conn: &mut Connection,
    key: &CacheKey,
    inventory: &Inventory,
    report: &CoverageReport,
    started: DateTime<Utc>,
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM scan WHERE fingerprint = ?1 AND scope = ?2",
        params![key.fingerprint, key.scope],
    )?;
    tx.execute(
        "INSERT INTO scan (fingerprint, scope, created_at, created_at_ms, report_count, \
         report_digest) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.fingerprint,
            key.scope,
            started.to_rfc3339(),
            started.timestamp_millis(),
            inventory.reports,
            inventory.digest
        ],
    )?;
    let scan_id = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO source_coverage (scan_id, path, unity_instrumented, unity_covered, \
             blackbox_instrumented, blackbox_covered, combined_instrumented, combined_covered) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for (path, c) in report.iter() {
            stmt.execute(params![
                scan_id,
                path.as_str(),
                c.unity_instrumented,
                c.unity_covered,
                c.blackbox_instrumented,
                c.blackbox_covered,
                c.combined_instrumented,
                c.combined_covered,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Best-effort cache in front of a scan.
pub struct ResultCache {
    conn: Option<Connection>,
}

impl ResultCache {
    /// Open the cache file. If it cannot be opened or initialized the
    /// cache is disabled and every lookup misses.
    pub fn open(path: &Path) -> Self {
        let conn = open(path).and_then(|conn| {
            init_schema(&conn)?;
            Ok(conn)
        });
        match conn {
            Ok(conn) => Self { conn: Some(conn) },
            Err(e) => {
                tracing::warn!(cache = %path.display(), "result cache unavailable: {e}");
                Self::disabled()
            }
        }
    }

    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory()
            .map_err(CovError::from)
            .and_then(|conn| {
                conn.execute_batch("PRAGMA foreign_keys=ON;")?;
                init_schema(&conn)?;
                Ok(conn)
            });
        match conn {
            Ok(conn) => Self { conn: Some(conn) },
            Err(e) => {
                tracing::warn!("in-memory result cache unavailable: {e}");
                Self::disabled()
            }
        }
    }

    /// A cache that never hits and never stores.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    /// The cached report for `key`, if present and computed from exactly
    /// the reports described by `current`.
    pub fn lookup(&self, key: &CacheKey, current: &Inventory) -> Option<CoverageReport> {
        let conn = self.conn.as_ref()?;
        let stored = match read_entry(conn, key) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("ignoring unreadable cache entry: {e}");
                return None;
            }
        };
        stored.is_fresh(current).then_some(stored.report)
    }

    /// Store `report` under `key`, computed from the reports in `inventory`.
    /// Returns whether it was written.
    pub fn store(
        &mut self,
        key: &CacheKey,
        inventory: &Inventory,
        report: &CoverageReport,
        started: DateTime<Utc>,
    ) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        match write_entry(conn, key, inventory, report, started) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("could not write result cache: {e}");
                false
            }
        }
    }

    /// Return the cached report for `key` when fresh for `current`,
    /// otherwise run `compute`, cache its result and return it. Only errors
    /// from `compute` are propagated. Take `current` before `compute` runs,
    /// so that reports changing mid-scan invalidate the entry.
    pub fn get_or_compute<F>(
        &mut self,
        key: &CacheKey,
        current: &Inventory,
        compute: F,
    ) -> Result<CoverageReport>
    where
        F: FnOnce() -> Result<CoverageReport>,
    {
        if let Some(report) = self.lookup(key, current) {
            tracing::info!(sources = report.len(), "result cache hit");
            return Ok(report);
        }

        tracing::debug!(fingerprint = %key.fingerprint, scope = %key.scope, "result cache miss");
        let started = Utc::now();
        let report = compute()?;
        self.store(key, current, &report, started);
        Ok(report)
    }

    /// Delete every cached scan. Returns how many were removed.
    pub fn clear(&mut self) -> Result<usize> {
        match self.conn.as_ref() {
            Some(conn) => Ok(conn.execute("DELETE FROM scan", [])?),
            None => Ok(0),
        }
    }
}
