//! Meta table initialization + version enforcement.

use super::*;

impl DigestIndex {
    pub(super) fn insert_initial_meta(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_FORMAT_VERSION, FORMAT_VERSION.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params![META_KEY_CREATED_BY, CHUNKDB_VERSION],
        )?;
        Ok(())
    }

    fn meta_value(&self, conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|err| self.classify(err))
    }

    pub(super) fn enforce_meta_version(
        &self,
        conn: &Connection,
        key: &str,
        expected: u32,
    ) -> Result<(), StoreError> {
        let value = self
            .meta_value(conn, key)?
            .ok_or_else(|| StoreError::MissingMeta(key.to_string()))?;
        match value.parse::<u32>() {
            Ok(parsed) if parsed == expected => Ok(()),
            _ => Err(StoreError::IncompatibleFormat {
                key: key.to_string(),
                expected: expected.to_string(),
                found: value,
            }),
        }
    }

    pub(super) fn require_meta_presence(
        &self,
        conn: &Connection,
        key: &str,
    ) -> Result<(), StoreError> {
        self.meta_value(conn, key)?
            .ok_or_else(|| StoreError::MissingMeta(key.to_string()))?;
        Ok(())
    }

    pub(super) fn record_last_used_version(&self) -> Result<(), StoreError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO meta(key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                params![META_KEY_LAST_USED, CHUNKDB_VERSION],
            )?;
            Ok(())
        })
    }

    /// Format version recorded in the file.
    pub(super) fn format_version(&self, conn: &Connection) -> Result<u32, StoreError> {
        let value = self
            .meta_value(conn, META_KEY_FORMAT_VERSION)?
            .ok_or_else(|| StoreError::MissingMeta(META_KEY_FORMAT_VERSION.to_string()))?;
        value.parse().map_err(|_| StoreError::IncompatibleFormat {
            key: META_KEY_FORMAT_VERSION.to_string(),
            expected: FORMAT_VERSION.to_string(),
            found: value,
        })
    }
}
