//! Open-time validation.

use super::*;

impl DigestIndex {
    /// Reject a file whose pages SQLite itself cannot trust.
    pub(super) fn run_quick_check(&self) -> Result<(), StoreError> {
        let conn = self.writer();
        let mut stmt = conn
            .prepare("PRAGMA quick_check")
            .map_err(|err| self.classify(err))?;
        let results = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| self.classify(err))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|err| self.classify(err))?;
        match results.first() {
            Some(result) if result.eq_ignore_ascii_case("ok") => Ok(()),
            Some(_) => Err(StoreError::corruption(&self.path, results.join("; "))),
            None => Err(StoreError::corruption(&self.path, "quick_check returned nothing")),
        }
    }

    pub(super) fn validate(&self) -> Result<(), StoreError> {
        let conn = self.writer();
        self.assert_expected_tables(&conn)?;
        self.enforce_meta_version(&conn, META_KEY_FORMAT_VERSION, FORMAT_VERSION)?;
        self.enforce_meta_version(&conn, META_KEY_SCHEMA_VERSION, SCHEMA_VERSION)?;
        self.require_meta_presence(&conn, META_KEY_CREATED_BY)?;
        Ok(())
    }

    fn assert_expected_tables(&self, conn: &Connection) -> Result<(), StoreError> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
            .map_err(|err| self.classify(err))?;
        let found = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| self.classify(err))?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .map_err(|err| self.classify(err))?;
        if !found.contains("meta") {
            // Some other SQLite file; nothing here was written by us.
            return Err(StoreError::MissingMeta(META_KEY_FORMAT_VERSION.to_string()));
        }
        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|name| !found.contains(*name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            warn!(path = %self.path.display(), missing = ?missing, "dedup index is missing tables");
            Err(StoreError::corruption(
                &self.path,
                format!("missing tables: {}", missing.join(", ")),
            ))
        }
    }
}
