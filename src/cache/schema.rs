//! Cache database schema and in-place upgrades.
//!
//! Version history:
//! - 1: `entries` without indexed summary columns.
//! - 2: adds `risk_level` and `score`, extracted from the payload.

use super::entry::PayloadSummary;
use crate::model::RiskLevel;
use rusqlite::{params, Connection, OptionalExtension};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// Rows rewritten per transaction while backfilling.
pub const MIGRATION_BATCH_SIZE: usize = 100;

const CREATE_TABLES: &str = r#"
    CREATE TABLE IF NOT EXISTS metadata (
        id             INTEGER PRIMARY KEY CHECK (id = 1),
        schema_version INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS entries (
        id         INTEGER PRIMARY KEY,
        item_id    TEXT    NOT NULL,
        version    TEXT    NOT NULL,
        payload    BLOB    NOT NULL,
        signature  BLOB    NOT NULL,
        risk_level TEXT,
        score      INTEGER,
        scanned_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_item_version ON entries (item_id, version);
    CREATE INDEX IF NOT EXISTS idx_entries_scanned_at ON entries (scanned_at);
"#;

// Needs the version 2 columns, so it runs after any upgrade.
const CREATE_SECONDARY_INDEXES: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_entries_risk_level ON entries (risk_level);
"#;

/// Outcome of an upgrade performed by [`migrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: i64,
    pub to: i64,
    pub rows_updated: u64,
}

/// Creates missing tables. A brand-new database is stamped with the current
/// version; an existing one keeps its recorded version until [`migrate`] runs.
pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_TABLES)?;
    conn.execute(
        "INSERT OR IGNORE INTO metadata (id, schema_version) VALUES (1, ?1)",
        params![CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT schema_version FROM metadata WHERE id = 1", [], |row| {
        row.get(0)
    })
    .optional()
}

/// Upgrades the schema to [`CURRENT_SCHEMA_VERSION`], returning `None` when
/// nothing had to change.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<Option<MigrationReport>> {
    let from = schema_version(conn)?.unwrap_or(1);
    let mut rows_updated = 0;

    if from < 2 {
        add_column_if_missing(conn, "risk_level", "TEXT")?;
        add_column_if_missing(conn, "score", "INTEGER")?;
        rows_updated += backfill_summaries(conn)?;
    }

    conn.execute_batch(CREATE_SECONDARY_INDEXES)?;

    if from >= CURRENT_SCHEMA_VERSION {
        return Ok(None);
    }

    conn.execute(
        "INSERT INTO metadata (id, schema_version) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET schema_version = excluded.schema_version",
        params![CURRENT_SCHEMA_VERSION],
    )?;

    Ok(Some(MigrationReport {
        from,
        to: CURRENT_SCHEMA_VERSION,
        rows_updated,
    }))
}

fn add_column_if_missing(conn: &Connection, column: &str, decl: &str) -> rusqlite::Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('entries') WHERE name = ?1",
        params![column],
        |row| row.get(0),
    )?;
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE entries ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}

/// Fills `risk_level`/`score` for rows that predate those columns, walking the
/// table by rowid so at most one batch of payloads is in memory.
fn backfill_summaries(conn: &mut Connection) -> rusqlite::Result<u64> {
    let mut last_id = 0i64;
    let mut updated = 0u64;

    loop {
        let batch: Vec<(i64, Vec<u8>)> = {
            let mut stmt = conn.prepare_cached(
                "SELECT id, payload FROM entries
                 WHERE id > ?1 AND risk_level IS NULL
                 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![last_id, MIGRATION_BATCH_SIZE as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let Some((tail_id, _)) = batch.last() else {
            break;
        };
        last_id = *tail_id;

        let tx = conn.transaction()?;
        {
            let mut update =
                tx.prepare_cached("UPDATE entries SET risk_level = ?1, score = ?2 WHERE id = ?3")?;
            for (id, payload) in &batch {
                let summary = PayloadSummary::from_payload(payload).unwrap_or(PayloadSummary {
                    risk_level: RiskLevel::Unknown,
                    score: 0,
                });
                update.execute(params![summary.risk_level.as_str(), summary.score, id])?;
                updated += 1;
            }
        }
        tx.commit()?;
    }

    Ok(updated)
}

/// Schema as written by version 1, kept for upgrade tests.
#[cfg(test)]
pub(crate) const V1_SCHEMA: &str = r#"
    CREATE TABLE metadata (
        id             INTEGER PRIMARY KEY CHECK (id = 1),
        schema_version INTEGER NOT NULL
    );
    INSERT INTO metadata (id, schema_version) VALUES (1, 1);
    CREATE TABLE entries (
        id         INTEGER PRIMARY KEY,
        item_id    TEXT    NOT NULL,
        version    TEXT    NOT NULL,
        payload    BLOB    NOT NULL,
        signature  BLOB    NOT NULL,
        scanned_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX idx_entries_item_version ON entries (item_id, version);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_with_rows(count: usize) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_SCHEMA).unwrap();
        for i in 0..count {
            let risk = if i % 2 == 0 { "high" } else { "low" };
            let payload = format!(r#"{{"risk_level":"{risk}","score":{i}}}"#);
            conn.execute(
                "INSERT INTO entries (item_id, version, payload, signature, scanned_at)
                 VALUES (?1, '1.0', ?2, x'00', 0)",
                params![format!("pub.ext{i}"), payload.into_bytes()],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn test_initialize_stamps_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn test_migrate_is_noop_on_current_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        assert_eq!(migrate(&mut conn).unwrap(), None);
    }

    #[test]
    fn test_migrate_v1_backfills_in_batches() {
        let rows = MIGRATION_BATCH_SIZE * 2 + 17;
        let mut conn = v1_with_rows(rows);
        initialize(&conn).unwrap();

        let report = migrate(&mut conn).unwrap().unwrap();
        assert_eq!(report.from, 1);
        assert_eq!(report.to, CURRENT_SCHEMA_VERSION);
        assert_eq!(report.rows_updated, rows as u64);
        assert_eq!(schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));

        let (risk, score): (String, i64) = conn
            .query_row(
                "SELECT risk_level, score FROM entries WHERE item_id = 'pub.ext4'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(risk, "high");
        assert_eq!(score, 4);

        let missing: i64 = conn
            .query_row("SELECT COUNT(*) FROM entries WHERE risk_level IS NULL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(missing, 0);
    }

    #[test]
    fn test_unparseable_payload_backfills_unknown() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_SCHEMA).unwrap();
        conn.execute(
            "INSERT INTO entries (item_id, version, payload, signature, scanned_at)
             VALUES ('a.b', '1', x'ff00', x'00', 0)",
            [],
        )
        .unwrap();

        migrate(&mut conn).unwrap();
        let risk: String = conn
            .query_row("SELECT risk_level FROM entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(risk, "unknown");
    }
}
