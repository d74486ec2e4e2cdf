#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Data model shared by the chunk dedup store and its callers.

pub mod chunk;
pub mod digest;
pub mod error;

pub use chunk::{BlobId, ChunkLocation, ChunkRecord, ChunkRequest, ChunkSource, Compression};
pub use digest::{ChunkDigest, DIGEST_LEN};
pub use error::DomainError;
