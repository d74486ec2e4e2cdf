#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

//! Chunk deduplication store for lazily pulled image layers.
//!
//! The read path calls [`ChunkResolver::resolve`] once per chunk. Chunks that
//! some earlier mount (in this process or any other process sharing the same
//! database path) already fetched and verified resolve to the recorded
//! location without touching the backend. Everything else is fetched once per
//! digest, verified, and committed to the [`DigestIndex`].

mod backend;
mod cancel;
mod config;
mod error;
mod guard;
mod local;
mod metrics;
mod resolver;
mod store;
pub mod verify;

pub use backend::{BackendMetrics, BackendMetricsSnapshot, BlobBackend, MeteredBackend};
pub use cancel::Cancellation;
pub use config::{DedupConfig, EnvSnapshot, HitVerification};
pub use error::DedupError;
pub use metrics::{DedupMetrics, DedupMetricsSnapshot};
pub use resolver::{ChunkResolver, IndexLookup, Resolved};
pub use store::{AuditSummary, DigestIndex, IndexOptions, IndexStats, StoreError};
pub use verify::IntegrityFailure;

pub use chunkdb_domain::{
    BlobId, ChunkDigest, ChunkLocation, ChunkRecord, ChunkRequest, ChunkSource, Compression,
};
