//! Locally kept blob copies and summary stats.

use super::*;

impl DigestIndex {
    /// Note that `blob_id` is available on local disk at `local_path`.
    ///
    /// Re-registering a blob replaces its path; chunk rows are unaffected.
    pub fn register_blob(&self, blob_id: &BlobId, local_path: &Path) -> Result<(), StoreError> {
        let local = local_path.to_str().ok_or_else(|| {
            StoreError::io_fatal(
                local_path,
                "local blob path is not valid UTF-8",
            )
        })?;
        let now = signed_now();
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO blobs(blob_id, local_path, registered_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(blob_id) DO UPDATE SET local_path=excluded.local_path, \
                 registered_at=excluded.registered_at",
                params![blob_id.as_str(), local, now],
            )?;
            Ok(())
        })?;
        debug!(blob = %blob_id, path = %local_path.display(), "registered local blob copy");
        Ok(())
    }

    pub fn blob_path(&self, blob_id: &BlobId) -> Result<Option<PathBuf>, StoreError> {
        let path: Option<String> = self
            .reader()
            .query_row(
                "SELECT local_path FROM blobs WHERE blob_id = ?1",
                params![blob_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| self.classify(err))?;
        Ok(path.map(PathBuf::from))
    }

    pub fn stats(&self) -> Result<IndexStats, StoreError> {
        let chunks = self.chunk_count()?;
        let conn = self.reader();
        let blobs: i64 = conn
            .query_row("SELECT count(*) FROM blobs", [], |row| row.get(0))
            .map_err(|err| self.classify(err))?;
        Ok(IndexStats {
            chunks,
            blobs: u64::try_from(blobs).unwrap_or_default(),
            format_version: self.format_version(&conn)?,
        })
    }
}

fn signed_now() -> i64 {
    i64::try_from(timestamp_secs()).unwrap_or(i64::MAX)
}
