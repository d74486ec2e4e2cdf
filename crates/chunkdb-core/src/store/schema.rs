//! Index schema initialization (SQLite DDL).

use super::*;

impl DigestIndex {
    /// Create tables and version markers in a database that has none.
    ///
    /// Runs as a single IMMEDIATE transaction so two instances opening a fresh
    /// file at the same time cannot both initialize it. A database that already
    /// has tables is left untouched for validation to judge.
    pub(super) fn init_schema(&self) -> Result<bool, StoreError> {
        let created = self.with_immediate_tx(|tx| {
            let tables: i64 = tx.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )?;
            if tables > 0 {
                return Ok(false);
            }
            tx.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS chunks (
                    digest TEXT PRIMARY KEY,
                    blob_id TEXT NOT NULL,
                    offset INTEGER NOT NULL,
                    compressed_size INTEGER NOT NULL,
                    uncompressed_size INTEGER NOT NULL,
                    compression TEXT NOT NULL,
                    first_seen_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS blobs (
                    blob_id TEXT PRIMARY KEY,
                    local_path TEXT NOT NULL,
                    registered_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS chunks_by_blob ON chunks(blob_id);
                "#,
            )?;
            Self::insert_initial_meta(tx)?;
            Ok(true)
        })?;
        if created {
            debug!(path = %self.path.display(), "initialized dedup index schema");
        }
        Ok(created)
    }
}
