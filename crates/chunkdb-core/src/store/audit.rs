//! Read-only sweep that re-verifies chunks against local blob copies.

use serde::Serialize;

use super::*;
use crate::local;
use crate::verify::verify_chunk;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    /// Records with a registered local copy that were examined.
    pub checked: u64,
    pub verified: u64,
    pub missing_local: u64,
    /// Records whose local bytes did not hash to the recorded digest.
    pub corrupt: Vec<ChunkDigest>,
}

impl AuditSummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

impl DigestIndex {
    /// Verify up to `limit` records whose blob has a registered local copy.
    ///
    /// Nothing is modified: rows are append-only, so a corrupt local copy is
    /// only reported. Resolution already refuses such hits when configured to
    /// verify local bytes.
    pub fn audit_local_copies(&self, limit: Option<usize>) -> Result<AuditSummary, StoreError> {
        let limit = limit.map_or(-1, |value| i64::try_from(value).unwrap_or(i64::MAX));
        let rows = {
            let conn = self.reader();
            let mut stmt = conn
                .prepare(
                    "SELECT c.digest, c.blob_id, c.offset, c.compressed_size, \
                     c.uncompressed_size, c.compression, c.first_seen_at, b.local_path \
                     FROM chunks c JOIN blobs b ON b.blob_id = c.blob_id \
                     ORDER BY c.first_seen_at, c.digest LIMIT ?1",
                )
                .map_err(|err| self.classify(err))?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((chunks::RawChunkRow::from_row(row)?, row.get::<_, String>(7)?))
                })
                .map_err(|err| self.classify(err))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|err| self.classify(err))?;
            rows
        };

        let mut summary = AuditSummary::default();
        for (raw, local_path) in rows {
            let record = raw.decode(&self.path)?;
            summary.checked += 1;
            let bytes = match local::read_range(
                Path::new(&local_path),
                record.offset,
                record.compressed_size,
            ) {
                Ok(bytes) => bytes,
                Err(err) if local::is_missing(&err) => {
                    summary.missing_local += 1;
                    continue;
                }
                Err(err) => {
                    warn!(digest = %record.digest, error = %format!("{err:#}"), "local chunk unreadable");
                    summary.corrupt.push(record.digest);
                    continue;
                }
            };
            match verify_chunk(
                &record.digest,
                record.compression,
                bytes,
                record.uncompressed_size,
            ) {
                Ok(_) => summary.verified += 1,
                Err(failure) => {
                    warn!(digest = %record.digest, %failure, "local chunk failed verification");
                    summary.corrupt.push(record.digest);
                }
            }
        }
        debug!(
            checked = summary.checked,
            verified = summary.verified,
            missing = summary.missing_local,
            corrupt = summary.corrupt.len(),
            "dedup index audit finished"
        );
        Ok(summary)
    }
}
