//! Chunk records (lookup/insert).

use super::*;

pub(super) struct RawChunkRow {
    digest: String,
    blob_id: String,
    offset: i64,
    compressed_size: i64,
    uncompressed_size: i64,
    compression: String,
    first_seen_at: i64,
}

impl RawChunkRow {
    pub(super) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            digest: row.get(0)?,
            blob_id: row.get(1)?,
            offset: row.get(2)?,
            compressed_size: row.get(3)?,
            uncompressed_size: row.get(4)?,
            compression: row.get(5)?,
            first_seen_at: row.get(6)?,
        })
    }

    pub(super) fn decode(self, path: &Path) -> Result<ChunkRecord, StoreError> {
        let corrupt = |what: &str, detail: String| {
            StoreError::corruption(path, format!("chunk row {}: invalid {what}: {detail}", self.digest))
        };
        let unsigned = |what: &str, value: i64| {
            u64::try_from(value).map_err(|_| corrupt(what, value.to_string()))
        };
        Ok(ChunkRecord {
            digest: ChunkDigest::from_hex(&self.digest)
                .map_err(|err| corrupt("digest", err.to_string()))?,
            blob_id: BlobId::new(self.blob_id.clone())
                .map_err(|err| corrupt("blob id", err.to_string()))?,
            offset: unsigned("offset", self.offset)?,
            compressed_size: unsigned("compressed size", self.compressed_size)?,
            uncompressed_size: unsigned("uncompressed size", self.uncompressed_size)?,
            compression: Compression::try_from(self.compression.as_str())
                .map_err(|err| corrupt("compression", err.to_string()))?,
            first_seen_at: unsigned("timestamp", self.first_seen_at)?,
        })
    }
}

fn signed(path: &Path, what: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::corruption(path, format!("{what} {value} does not fit the index")))
}

impl DigestIndex {
    /// The authoritative record for `digest`, if one was ever committed.
    pub fn get(&self, digest: &ChunkDigest) -> Result<Option<ChunkRecord>, StoreError> {
        let raw = {
            let conn = self.reader();
            conn.query_row(
                "SELECT digest, blob_id, offset, compressed_size, uncompressed_size, \
                 compression, first_seen_at FROM chunks WHERE digest = ?1",
                params![digest.to_hex()],
                RawChunkRow::from_row,
            )
            .optional()
            .map_err(|err| self.classify(err))?
        };
        raw.map(|row| row.decode(&self.path)).transpose()
    }

    /// Record `record` unless the digest is already present.
    ///
    /// Returns `true` when this call inserted the row. An existing row is never
    /// modified, whatever `record` says.
    pub fn put_if_absent(&self, record: &ChunkRecord) -> Result<bool, StoreError> {
        let offset = signed(&self.path, "offset", record.offset)?;
        let compressed = signed(&self.path, "compressed size", record.compressed_size)?;
        let uncompressed = signed(&self.path, "uncompressed size", record.uncompressed_size)?;
        let seen = signed(&self.path, "timestamp", record.first_seen_at)?;
        let inserted = self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO chunks(digest, blob_id, offset, compressed_size, \
                 uncompressed_size, compression, first_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.digest.to_hex(),
                    record.blob_id.as_str(),
                    offset,
                    compressed,
                    uncompressed,
                    record.compression.as_str(),
                    seen,
                ],
            )
        })?;
        debug!(
            digest = %record.digest,
            blob = %record.blob_id,
            offset = record.offset,
            inserted = inserted == 1,
            "dedup index commit"
        );
        Ok(inserted == 1)
    }

    pub fn chunk_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .reader()
            .query_row("SELECT count(*) FROM chunks", [], |row| row.get(0))
            .map_err(|err| self.classify(err))?;
        u64::try_from(count).map_err(|_| StoreError::corruption(&self.path, "negative row count"))
    }
}
