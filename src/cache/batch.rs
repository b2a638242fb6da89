use super::entry::CacheEntry;
use super::signer::Signer;
use rusqlite::{params, Transaction};

const UPSERT_ENTRY: &str = r#"
    INSERT INTO entries (item_id, version, payload, signature, risk_level, score, scanned_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(item_id, version) DO UPDATE SET
        payload    = excluded.payload,
        signature  = excluded.signature,
        risk_level = excluded.risk_level,
        score      = excluded.score,
        scanned_at = excluded.scanned_at
"#;

/// A write transaction over the cache.
///
/// Nothing is visible to readers until [`commit`](Self::commit). Dropping the
/// batch without committing, whether through `?`, a panic or a cancelled
/// future, rolls the transaction back and releases it.
pub struct CacheBatch<'a> {
    tx: Transaction<'a>,
    signer: &'a Signer,
    written: usize,
}

impl<'a> CacheBatch<'a> {
    pub(super) fn new(tx: Transaction<'a>, signer: &'a Signer) -> Self {
        Self {
            tx,
            signer,
            written: 0,
        }
    }

    /// Signs and upserts one entry. Writing the same `(item_id, version)`
    /// again replaces the earlier row.
    pub fn put(&mut self, entry: &CacheEntry) -> rusqlite::Result<()> {
        let scanned_at_ms = entry.scanned_at.timestamp_millis();
        let signature = self
            .signer
            .sign(&entry.item_id, &entry.version, &entry.payload, scanned_at_ms);

        let mut stmt = self.tx.prepare_cached(UPSERT_ENTRY)?;
        stmt.execute(params![
            entry.item_id,
            entry.version,
            entry.payload,
            signature,
            entry.risk_level.as_str(),
            entry.score,
            scanned_at_ms,
        ])?;
        self.written += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Commits every entry written so far and returns how many there were.
    pub fn commit(self) -> rusqlite::Result<usize> {
        let written = self.written;
        self.tx.commit()?;
        Ok(written)
    }

    /// Discards the batch explicitly.
    pub fn rollback(self) -> rusqlite::Result<()> {
        self.tx.rollback()
    }
}

impl std::fmt::Debug for CacheBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBatch")
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}
