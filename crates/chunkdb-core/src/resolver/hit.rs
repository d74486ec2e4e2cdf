//! Index lookups and the hit path.

use anyhow::anyhow;

use super::*;
use crate::local;
use crate::verify::verify_chunk;

impl<B: BlobBackend> ChunkResolver<B> {
    /// Consult the index for `digest`.
    ///
    /// Recoverable index failures read as [`IndexLookup::Miss`] (busy) or
    /// [`IndexLookup::Disabled`] (degraded).
    pub fn lookup(&self, digest: &ChunkDigest) -> Result<IndexLookup, DedupError> {
        let Some(index) = self.active_index() else {
            return Ok(IndexLookup::Disabled);
        };
        self.metrics.lookup();
        match index.get(digest) {
            Ok(Some(record)) => Ok(IndexLookup::Hit(record)),
            Ok(None) => Ok(IndexLookup::Miss),
            Err(err) => {
                self.absorb(err)?;
                if self.metrics.is_degraded() {
                    Ok(IndexLookup::Disabled)
                } else {
                    Ok(IndexLookup::Miss)
                }
            }
        }
    }

    /// A trustworthy hit for `request`, if the index has one.
    pub(super) fn try_hit(&self, request: &ChunkRequest) -> Result<Option<Resolved>, DedupError> {
        let IndexLookup::Hit(record) = self.lookup(&request.digest)? else {
            return Ok(None);
        };
        if !record.is_consistent_with(request.expected_size) {
            self.metrics.rejected_hit();
            warn!(
                digest = %request.digest,
                expected = request.expected_size,
                recorded = record.uncompressed_size,
                compressed = record.compressed_size,
                "dedup record sizes disagree with request; treating as miss"
            );
            return Ok(None);
        }
        let data = match self.config.hit_verification {
            HitVerification::TrustMetadata => None,
            HitVerification::VerifyLocalBytes => match self.read_local(&record) {
                Ok(bytes) => Some(Arc::from(bytes)),
                Err(err) => {
                    self.metrics.rejected_hit();
                    warn!(
                        digest = %request.digest,
                        blob = %record.blob_id,
                        error = %format!("{err:#}"),
                        "local chunk copy unusable; falling back to backend"
                    );
                    return Ok(None);
                }
            },
        };
        self.metrics.hit();
        debug!(
            digest = %request.digest,
            blob = %record.blob_id,
            offset = record.offset,
            verified = data.is_some(),
            "dedup hit"
        );
        Ok(Some(Resolved::Deduplicated {
            location: record.location(),
            data,
        }))
    }

    fn read_local(&self, record: &ChunkRecord) -> anyhow::Result<Vec<u8>> {
        let index = self
            .active_index()
            .ok_or_else(|| anyhow!("dedup index unavailable"))?;
        let path = index
            .blob_path(&record.blob_id)?
            .ok_or_else(|| anyhow!("no local copy registered for blob {}", record.blob_id))?;
        let raw = local::read_range(&path, record.offset, record.compressed_size)?;
        Ok(verify_chunk(
            &record.digest,
            record.compression,
            raw,
            record.uncompressed_size,
        )?)
    }
}
