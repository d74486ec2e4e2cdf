//! SQLite connection + transaction helpers.

use super::*;

impl DigestIndex {
    pub(super) fn connection_raw(
        path: &Path,
        options: &IndexOptions,
    ) -> Result<Connection, StoreError> {
        let conn = Connection::open(path).map_err(|err| classify_sqlite(path, err))?;
        // Switching to WAL takes a write lock; wait for concurrent openers first.
        conn.busy_timeout(options.busy_timeout)
            .map_err(|err| classify_sqlite(path, err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| classify_sqlite(path, err))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|err| classify_sqlite(path, err))?;
        Ok(conn)
    }

    /// Second connection for lookups. The journal mode is a property of the
    /// file, so only the writer sets it.
    pub(super) fn reader_raw(
        path: &Path,
        options: &IndexOptions,
    ) -> Result<Connection, StoreError> {
        let conn = Connection::open(path).map_err(|err| classify_sqlite(path, err))?;
        conn.busy_timeout(options.busy_timeout)
            .map_err(|err| classify_sqlite(path, err))?;
        conn.pragma_update(None, "query_only", true)
            .map_err(|err| classify_sqlite(path, err))?;
        Ok(conn)
    }

    pub(super) fn with_immediate_tx<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.writer();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| self.classify(err))?;
        let result = f(&tx).map_err(|err| self.classify(err))?;
        tx.commit().map_err(|err| self.classify(err))?;
        Ok(result)
    }
}
