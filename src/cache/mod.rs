//! Persistent, integrity-checked cache of scan results.
//!
//! The cache is a single SQLite file keyed by `(item_id, version)`. Every row
//! carries an HMAC signature that is re-verified on read, so a tampered or
//! bit-rotted row is reported and treated as a miss instead of being served.
//!
//! Nothing in this module prints or logs on the caller's behalf: anything
//! worth surfacing comes back as a [`CacheWarning`].
//!
//! # Cache Location
//!
//! By default the database lives in the platform cache directory:
//! - Linux: `~/.cache/extaudit/scans.db`
//! - macOS: `~/Library/Caches/extaudit/scans.db`
//! - Windows: `%LOCALAPPDATA%\extaudit\scans.db`
//!
//! The signing key sits next to it as `scans.key`.
//!
//! # Example
//!
//! ```no_run
//! use extaudit::cache::{CacheOptions, CacheStore, Lookup};
//!
//! let opened = CacheStore::open("/tmp/extaudit/scans.db", CacheOptions::default())?;
//! for warning in &opened.warnings {
//!     eprintln!("warning: {warning}");
//! }
//!
//! match opened.store.get("publisher.ext", "1.0.0")? {
//!     Lookup::Hit(entry) => println!("cached risk: {}", entry.risk_level),
//!     Lookup::Miss => println!("not cached"),
//!     Lookup::Rejected(warning) => println!("ignored: {warning}"),
//! }
//! # Ok::<(), extaudit::error::CacheError>(())
//! ```

mod batch;
mod entry;
mod schema;
mod signer;

pub use batch::CacheBatch;
pub use entry::{is_stale, CacheEntry, PayloadSummary};
pub use schema::{MigrationReport, CURRENT_SCHEMA_VERSION, MIGRATION_BATCH_SIZE};
pub use signer::{KeyOrigin, Signer};

use crate::error::CacheError;
use crate::model::RiskLevel;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file size above which [`CacheStore::cleanup`] compacts the database.
pub const DEFAULT_VACUUM_SIZE_THRESHOLD: u64 = 50 * 1024 * 1024;
/// Default number of removed rows above which [`CacheStore::cleanup`] compacts.
pub const DEFAULT_VACUUM_ROW_THRESHOLD: u64 = 500;

/// How long any connection waits on another process's lock.
const BUSY_TIMEOUT: Duration = Duration::from_millis(1500);

const FILE_PRAGMAS: &str = r#"
    PRAGMA busy_timeout = 1500;
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA temp_store = MEMORY;
"#;

/// Something the caller may want to tell the user about. None of these stop
/// the cache from working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheWarning {
    /// The file failed its integrity check and was moved aside.
    Recovered { backup: PathBuf, reason: String },
    /// The signing key was unreadable and a new one was written. Rows signed
    /// with the old key will be rejected and rescanned.
    KeyRegenerated { path: PathBuf, reason: String },
    /// The schema was upgraded in place.
    Migrated { from: i64, to: i64, rows: u64 },
    /// A stored row did not match its signature and was ignored.
    IntegrityMismatch { item_id: String, version: String },
    /// A batch was rolled back; earlier batches are unaffected.
    BatchWriteFailed { entries: usize, reason: String },
    /// A lookup failed; the item was treated as a miss.
    ReadFailed {
        item_id: String,
        version: String,
        reason: String,
    },
}

impl std::fmt::Display for CacheWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheWarning::Recovered { backup, reason } => write!(
                f,
                "cache was corrupt ({}); moved to {} and started fresh",
                reason,
                backup.display()
            ),
            CacheWarning::KeyRegenerated { path, reason } => write!(
                f,
                "cache signing key at {} was unusable ({}); generated a new one",
                path.display(),
                reason
            ),
            CacheWarning::Migrated { from, to, rows } => {
                write!(f, "cache upgraded from schema {} to {} ({} rows)", from, to, rows)
            }
            CacheWarning::IntegrityMismatch { item_id, version } => write!(
                f,
                "cached result for {}@{} failed verification and was ignored",
                item_id, version
            ),
            CacheWarning::BatchWriteFailed { entries, reason } => {
                write!(f, "failed to cache {} results: {}", entries, reason)
            }
            CacheWarning::ReadFailed {
                item_id,
                version,
                reason,
            } => write!(f, "could not read cache for {}@{}: {}", item_id, version, reason),
        }
    }
}

/// Result of [`CacheStore::get`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
    /// A row existed but failed verification. Never carries the row itself.
    Rejected(CacheWarning),
}

impl Lookup {
    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Miss | Lookup::Rejected(_) => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Key used to sign rows. When `None`, file stores load or create
    /// `<name>.key` beside the database and in-memory stores use a random key.
    pub signer: Option<Signer>,
    pub vacuum_size_threshold: u64,
    pub vacuum_row_threshold: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            signer: None,
            vacuum_size_threshold: DEFAULT_VACUUM_SIZE_THRESHOLD,
            vacuum_row_threshold: DEFAULT_VACUUM_ROW_THRESHOLD,
        }
    }
}

/// A freshly opened store plus whatever happened while opening it.
#[derive(Debug)]
pub struct OpenedCache {
    pub store: CacheStore,
    pub warnings: Vec<CacheWarning>,
}

/// Aggregate numbers computed from indexed columns only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub fresh_entries: u64,
    pub stale_entries: u64,
    pub by_risk: BTreeMap<RiskLevel, u64>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub vacuumed: bool,
}

#[derive(Debug)]
pub struct CacheStore {
    conn: Connection,
    path: Option<PathBuf>,
    signer: Signer,
    vacuum_size_threshold: u64,
    vacuum_row_threshold: u64,
}

impl CacheStore {
    /// Opens (or creates) the cache at `path`.
    ///
    /// An existing file is checked first. If it is not a healthy cache
    /// database it is renamed to `<name>.corrupt-<timestamp>` and a fresh one
    /// is created in its place; the returned warnings say so. An older schema
    /// is upgraded in place.
    ///
    /// A damaged key file is replaced the same way. A file that is merely
    /// locked by another process or unreadable is left alone.
    ///
    /// # Errors
    ///
    /// Fails if no usable database can be produced at `path`, e.g. the
    /// directory is not writable, the file stays locked past the busy
    /// timeout, or the corrupt file cannot be moved.
    pub fn open(path: impl AsRef<Path>, options: CacheOptions) -> Result<OpenedCache, CacheError> {
        let path = path.as_ref();
        let mut warnings = Vec::new();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut recovered = false;
        if path.exists() {
            if let Some(reason) = inspect(path)? {
                let backup = quarantine(path).map_err(|e| CacheError::Unrecoverable {
                    path: path.to_path_buf(),
                    reason: format!("{reason}; moving it aside failed: {e}"),
                })?;
                warnings.push(CacheWarning::Recovered { backup, reason });
                recovered = true;
            }
        }

        let signer = match options.signer.clone() {
            Some(signer) => signer,
            None => {
                let key_file = key_path(path);
                let (signer, origin) = Signer::load_or_create(&key_file)?;
                if let KeyOrigin::Replaced { reason } = origin {
                    warnings.push(CacheWarning::KeyRegenerated {
                        path: key_file,
                        reason,
                    });
                }
                signer
            }
        };

        let fresh = Connection::open(path)
            .and_then(|conn| {
                conn.execute_batch(FILE_PRAGMAS)?;
                Ok(conn)
            })
            .map_err(CacheError::from)
            .and_then(|conn| Self::from_connection(conn, Some(path.to_path_buf()), signer, &options));

        let mut store = match fresh {
            Ok(store) => store,
            Err(e) if recovered => {
                return Err(CacheError::Unrecoverable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        if let Some(report) = store.migrate()? {
            warnings.push(CacheWarning::Migrated {
                from: report.from,
                to: report.to,
                rows: report.rows_updated,
            });
        }

        Ok(OpenedCache { store, warnings })
    }

    /// A throwaway store, used for tests and cache-less runs.
    pub fn open_in_memory(options: CacheOptions) -> Result<Self, CacheError> {
        let signer = match options.signer.clone() {
            Some(signer) => signer,
            None => Signer::ephemeral()?,
        };
        let mut store = Self::from_connection(Connection::open_in_memory()?, None, signer, &options)?;
        store.migrate()?;
        Ok(store)
    }

    fn from_connection(
        conn: Connection,
        path: Option<PathBuf>,
        signer: Signer,
        options: &CacheOptions,
    ) -> Result<Self, CacheError> {
        schema::initialize(&conn)?;
        Ok(Self {
            conn,
            path,
            signer,
            vacuum_size_threshold: options.vacuum_size_threshold,
            vacuum_row_threshold: options.vacuum_row_threshold,
        })
    }

    /// `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<i64, CacheError> {
        Ok(schema::schema_version(&self.conn)?.unwrap_or(CURRENT_SCHEMA_VERSION))
    }

    /// Brings the schema up to date. `open` already does this.
    pub fn migrate(&mut self) -> Result<Option<MigrationReport>, CacheError> {
        Ok(schema::migrate(&mut self.conn)?)
    }

    /// Looks up `(item_id, version)` and verifies the row's signature.
    ///
    /// A row for a different version is a miss. A row whose signature does
    /// not match is reported as [`Lookup::Rejected`] and never returned.
    /// `risk_level` and `score` on a hit are read from the signed payload.
    pub fn get(&self, item_id: &str, version: &str) -> Result<Lookup, CacheError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT payload, signature, scanned_at
             FROM entries WHERE item_id = ?1 AND version = ?2",
        )?;
        let row = stmt
            .query_row(params![item_id, version], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .optional()?;

        let Some((payload, signature, scanned_at_ms)) = row else {
            return Ok(Lookup::Miss);
        };

        let rejected = || {
            Lookup::Rejected(CacheWarning::IntegrityMismatch {
                item_id: item_id.to_string(),
                version: version.to_string(),
            })
        };

        if !self
            .signer
            .verify(item_id, version, &payload, scanned_at_ms, &signature)
        {
            return Ok(rejected());
        }
        let Some(scanned_at) = DateTime::<Utc>::from_timestamp_millis(scanned_at_ms) else {
            return Ok(rejected());
        };

        // The risk_level and score columns are unsigned and only feed `stats`;
        // a hit takes both from the verified payload.
        let summary = PayloadSummary::from_payload(&payload).unwrap_or(PayloadSummary {
            risk_level: RiskLevel::Unknown,
            score: 0,
        });
        let mut entry = CacheEntry::new(
            item_id,
            version,
            payload,
            summary.risk_level,
            summary.score,
            scanned_at,
        );
        entry.signature = signature;
        Ok(Lookup::Hit(entry))
    }

    /// Starts a write transaction. See [`CacheBatch`].
    pub fn begin_batch(&mut self) -> Result<CacheBatch<'_>, CacheError> {
        let tx = self.conn.transaction()?;
        Ok(CacheBatch::new(tx, &self.signer))
    }

    /// Writes `entries` in one transaction. On any error the whole batch is
    /// rolled back; previously committed batches stay intact.
    pub fn write_batch(&mut self, entries: &[CacheEntry]) -> Result<usize, CacheError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let count = entries.len();
        let failed = move |source| CacheError::BatchWrite {
            entries: count,
            source,
        };

        let tx = self.conn.transaction().map_err(failed)?;
        let mut batch = CacheBatch::new(tx, &self.signer);
        for entry in entries {
            batch.put(entry).map_err(failed)?;
        }
        batch.commit().map_err(failed)
    }

    /// Counts entries by freshness and risk without reading any payload.
    pub fn stats(&self, max_age: Duration) -> Result<CacheStats, CacheError> {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis().min(i64::MAX as u128) as i64;

        let (total, fresh, oldest, newest): (i64, i64, Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(scanned_at >= ?1), 0), MIN(scanned_at), MAX(scanned_at)
             FROM entries",
            params![cutoff],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let mut by_risk = BTreeMap::new();
        let mut stmt = self.conn.prepare_cached(
            "SELECT COALESCE(risk_level, 'unknown'), COUNT(*) FROM entries GROUP BY 1",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (risk, count) = row?;
            *by_risk.entry(RiskLevel::parse(&risk)).or_insert(0) += count as u64;
        }

        Ok(CacheStats {
            total_entries: total as u64,
            fresh_entries: fresh as u64,
            stale_entries: (total - fresh) as u64,
            by_risk,
            oldest: oldest.and_then(DateTime::<Utc>::from_timestamp_millis),
            newest: newest.and_then(DateTime::<Utc>::from_timestamp_millis),
            size_bytes: self.size_bytes()?,
        })
    }

    /// Removes entries whose `item_id` is not in `valid_ids`.
    ///
    /// The file is only compacted when it is larger than the configured size
    /// threshold or at least the configured number of rows went away.
    pub fn cleanup<I, S>(&mut self, valid_ids: I) -> Result<CleanupReport, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS valid_ids (item_id TEXT PRIMARY KEY);
             DELETE FROM temp.valid_ids;",
        )?;
        {
            let mut insert = tx.prepare_cached("INSERT OR IGNORE INTO temp.valid_ids (item_id) VALUES (?1)")?;
            for id in valid_ids {
                insert.execute(params![id.as_ref()])?;
            }
        }
        let removed = tx.execute(
            "DELETE FROM entries WHERE item_id NOT IN (SELECT item_id FROM temp.valid_ids)",
            [],
        )?;
        tx.execute_batch("DROP TABLE temp.valid_ids")?;
        tx.commit()?;

        let vacuumed = removed > 0
            && (self.size_bytes()? >= self.vacuum_size_threshold
                || removed as u64 >= self.vacuum_row_threshold);
        if vacuumed {
            self.conn.execute_batch("VACUUM")?;
        }

        Ok(CleanupReport { removed, vacuumed })
    }

    /// Deletes every entry. Returns how many were removed.
    pub fn clear(&mut self) -> Result<usize, CacheError> {
        Ok(self.conn.execute("DELETE FROM entries", [])?)
    }

    /// Runs SQLite's structural check against the live database.
    pub fn check_integrity(&self) -> Result<bool, CacheError> {
        let verdict: String = self
            .conn
            .pragma_query_value(None, "quick_check", |row| row.get(0))?;
        Ok(verdict == "ok")
    }

    fn size_bytes(&self) -> Result<u64, CacheError> {
        let page_count: i64 = self.conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
        let page_size: i64 = self.conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
        Ok((page_count * page_size) as u64)
    }

    /// Closes the database, letting SQLite refresh planner statistics first.
    pub fn close(self) -> Result<(), CacheError> {
        let _ = self.conn.execute_batch("PRAGMA optimize");
        self.conn.close().map_err(|(_, e)| CacheError::from(e))
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// `scans.db` -> `scans.key`.
pub fn key_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("key")
}

/// Checks that `path` holds a cache database this build can use.
///
/// Returns `Some(reason)` when the file is corrupt or incompatible and should
/// be moved aside. Errors that say nothing about the file's contents, such as
/// a lock held by another process or a permission problem, are returned as
/// errors so a healthy cache is never discarded.
fn inspect(path: &Path) -> Result<Option<String>, rusqlite::Error> {
    match check_file(path) {
        Err(e) if is_corruption(&e) => Ok(Some(e.to_string())),
        other => other,
    }
}

fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

/// Failures caused by the surroundings rather than the file's contents.
fn is_environmental(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::OutOfMemory
    )
}

fn check_file(path: &Path) -> Result<Option<String>, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let verdict: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if verdict != "ok" {
        return Ok(Some(format!("integrity check failed: {verdict}")));
    }

    let table_exists = |name: &str| -> Result<bool, rusqlite::Error> {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
    };

    let reason = match (table_exists("metadata")?, table_exists("entries")?) {
        (false, false) => None,
        (true, true) => match schema::schema_version(&conn) {
            Err(e) if e.sqlite_error_code().is_some_and(is_environmental) => return Err(e),
            Err(e) => Some(format!("unreadable schema version: {e}")),
            Ok(None) => Some("schema version is missing".to_string()),
            Ok(Some(v)) if v > CURRENT_SCHEMA_VERSION => Some(format!(
                "schema version {v} is newer than supported version {CURRENT_SCHEMA_VERSION}"
            )),
            Ok(Some(v)) if v < 1 => Some(format!("invalid schema version {v}")),
            Ok(Some(_)) => None,
        },
        _ => Some("cache tables are incomplete".to_string()),
    };
    Ok(reason)
}

/// Renames a bad database (and its WAL side files) out of the way.
fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache.db".to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");

    let mut backup = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
    let mut n = 1;
    while backup.exists() {
        backup = path.with_file_name(format!("{file_name}.corrupt-{stamp}-{n}"));
        n += 1;
    }

    fs::rename(path, &backup)?;
    for suffix in ["-wal", "-shm"] {
        let side = PathBuf::from(format!("{}{suffix}", path.display()));
        if side.exists() {
            fs::rename(&side, PathBuf::from(format!("{}{suffix}", backup.display())))?;
        }
    }
    Ok(backup)
}
