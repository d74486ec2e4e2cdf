use chunkdb_domain::{BlobId, ChunkDigest};

use crate::store::StoreError;
use crate::verify::IntegrityFailure;

/// Errors surfaced by [`crate::ChunkResolver::resolve`].
///
/// Only conditions that would compromise correctness reach the caller. Index
/// corruption and lock contention are absorbed and degrade to plain backend
/// reads instead.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DedupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("[CD820] chunk {digest} failed verification after {attempts} fetch attempt(s): {failure}")]
    IntegrityMismatch {
        digest: ChunkDigest,
        attempts: u32,
        failure: IntegrityFailure,
    },
    #[error("[CD830] backend read of {blob_id} at offset {offset} failed: {message}")]
    BackendFetch {
        blob_id: BlobId,
        offset: u64,
        message: String,
    },
    #[error("[CD840] timed out waiting for the in-flight resolution of chunk {digest}")]
    LockTimeout { digest: ChunkDigest },
    #[error("[CD850] chunk resolution was cancelled")]
    Cancelled,
}

impl DedupError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(err) => err.code(),
            Self::IntegrityMismatch { .. } => "CD820",
            Self::BackendFetch { .. } => "CD830",
            Self::LockTimeout { .. } => "CD840",
            Self::Cancelled => "CD850",
        }
    }
}
