//! Lookup/insert coordinator.
//!
//! [`ChunkResolver::resolve`] is the only entry point the read path needs:
//! index hit, or one verified backend fetch per digest followed by a
//! first-writer-wins commit. Failures that only cost the optimization (a
//! corrupt or busy index, lock contention) are absorbed here; integrity
//! failures, backend failures and fatal storage errors reach the caller.
//!
//! The implementation is split by path:
//! - hits + lookup classification: `hit.rs`
//! - leader/fetch/commit: `miss.rs`

use std::path::Path;
use std::sync::Arc;

use chunkdb_domain::{BlobId, ChunkDigest, ChunkLocation, ChunkRecord, ChunkRequest};
use tracing::{debug, warn};

use crate::backend::BlobBackend;
use crate::cancel::Cancellation;
use crate::config::{DedupConfig, HitVerification};
use crate::error::DedupError;
use crate::guard::{ConcurrencyGuard, FlightWait, Join, StripeAttempt};
use crate::metrics::{DedupMetrics, DedupMetricsSnapshot};
use crate::store::{timestamp_secs, DigestIndex, StoreError};

mod hit;
mod miss;

/// Result of a successful resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// A committed record covered the chunk; no backend I/O happened.
    ///
    /// `data` holds verified local bytes when hits are configured to read
    /// them, otherwise the runtime reads from `location` itself.
    Deduplicated {
        location: ChunkLocation,
        data: Option<Arc<[u8]>>,
    },
    /// The chunk was fetched from the backend and verified. `committed` is
    /// `true` when this fetch's record became the authoritative one.
    Fetched {
        location: ChunkLocation,
        data: Arc<[u8]>,
        committed: bool,
    },
}

impl Resolved {
    pub fn location(&self) -> &ChunkLocation {
        match self {
            Self::Deduplicated { location, .. } | Self::Fetched { location, .. } => location,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Deduplicated { data, .. } => data.as_deref(),
            Self::Fetched { data, .. } => Some(&data[..]),
        }
    }

    pub fn is_deduplicated(&self) -> bool {
        matches!(self, Self::Deduplicated { .. })
    }

    /// The outcome as seen by a caller that waited on someone else's fetch.
    fn shared(self) -> Self {
        match self {
            Self::Fetched { location, data, .. } => Self::Fetched {
                location,
                data,
                committed: false,
            },
            deduplicated @ Self::Deduplicated { .. } => deduplicated,
        }
    }
}

/// Outcome of consulting the index for one digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexLookup {
    Hit(ChunkRecord),
    Miss,
    /// No usable index: dedup is off or was degraded.
    Disabled,
}

pub struct ChunkResolver<B> {
    config: DedupConfig,
    index: Option<DigestIndex>,
    guard: ConcurrencyGuard<Result<Resolved, DedupError>>,
    backend: B,
    metrics: DedupMetrics,
}

impl<B: BlobBackend> ChunkResolver<B> {
    /// Open the configured index and build a resolver over `backend`.
    ///
    /// # Errors
    ///
    /// Only [`StoreError::IoFatal`] is returned. An index that exists but
    /// cannot be trusted leaves dedup disabled for this resolver.
    pub fn open(config: DedupConfig, backend: B) -> Result<Self, DedupError> {
        let mut degraded = false;
        let index = match config.database_path() {
            None => {
                debug!("dedup disabled: no database configured");
                None
            }
            Some(path) => match DigestIndex::open(path, &config.index_options()) {
                Ok(index) => Some(index),
                Err(err) if err.is_recoverable() => {
                    warn!(
                        path = %path.display(),
                        code = err.code(),
                        error = %err,
                        "dedup index unusable; continuing without deduplication"
                    );
                    degraded = true;
                    None
                }
                Err(err) => return Err(err.into()),
            },
        };
        let resolver = Self::with_index(index, config, backend);
        if degraded {
            resolver.metrics.mark_degraded();
        }
        Ok(resolver)
    }

    /// Build a resolver around an index handle the caller already opened.
    pub fn with_index(index: Option<DigestIndex>, config: DedupConfig, backend: B) -> Self {
        let guard = ConcurrencyGuard::new(
            index.as_ref().map(DigestIndex::path),
            config.lock_timeout(),
        );
        Self {
            config,
            index,
            guard,
            backend,
            metrics: DedupMetrics::default(),
        }
    }

    /// Resolve one chunk for the read path.
    ///
    /// Concurrent calls for the same digest share one backend fetch; callers
    /// that waited on another thread's fetch receive a clone of its outcome
    /// with `committed` cleared.
    pub fn resolve(
        &self,
        request: &ChunkRequest,
        cancel: &Cancellation,
    ) -> Result<Resolved, DedupError> {
        cancel.check()?;
        if let Some(hit) = self.try_hit(request)? {
            return Ok(hit);
        }
        self.metrics.miss();
        debug!(digest = %request.digest, blob = %request.source.blob_id, "dedup miss");

        loop {
            match self.guard.join(&request.digest) {
                Join::Leader(ticket) => {
                    let outcome = self.lead(request, cancel);
                    ticket.complete(outcome.clone());
                    return outcome;
                }
                Join::Follower(follower) => match follower.wait(self.guard.timeout(), cancel) {
                    // The leader gave up for its own reasons; start over.
                    FlightWait::Ready(Err(DedupError::Cancelled)) | FlightWait::Abandoned => {
                        cancel.check()?;
                    }
                    FlightWait::Ready(outcome) => return outcome.map(Resolved::shared),
                    FlightWait::Cancelled => return Err(DedupError::Cancelled),
                    FlightWait::TimedOut => {
                        self.metrics.lock_timeout();
                        let err = DedupError::LockTimeout {
                            digest: request.digest,
                        };
                        warn!(digest = %request.digest, error = %err, "taking over stalled chunk resolution");
                        return match self.try_hit(request)? {
                            Some(hit) => Ok(hit),
                            None => self.fetch_and_commit(request, cancel),
                        };
                    }
                },
            }
        }
    }

    /// Record that `blob_id` is kept locally at `local_path`.
    pub fn register_blob(&self, blob_id: &BlobId, local_path: &Path) -> Result<(), DedupError> {
        let Some(index) = self.active_index() else {
            return Ok(());
        };
        match index.register_blob(blob_id, local_path) {
            Ok(()) => Ok(()),
            Err(err) => self.absorb(err),
        }
    }

    pub fn metrics(&self) -> DedupMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether an index failure switched deduplication off.
    pub fn is_degraded(&self) -> bool {
        self.metrics.is_degraded()
    }

    pub fn index(&self) -> Option<&DigestIndex> {
        self.index.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Close the index handle, if any. Data stays on disk.
    pub fn close(self) -> Result<(), DedupError> {
        match self.index {
            Some(index) => index.close().map_err(DedupError::from),
            None => Ok(()),
        }
    }

    fn active_index(&self) -> Option<&DigestIndex> {
        if self.metrics.is_degraded() {
            None
        } else {
            self.index.as_ref()
        }
    }

    /// Swallow recoverable index failures. Corruption and format problems
    /// disable dedup for good; a busy database only costs the current call.
    fn absorb(&self, err: StoreError) -> Result<(), DedupError> {
        match err {
            StoreError::IoFatal { .. } => Err(err.into()),
            StoreError::Busy { .. } => {
                debug!(error = %err, "dedup index busy; skipping");
                Ok(())
            }
            StoreError::Corruption { .. }
            | StoreError::MissingMeta(_)
            | StoreError::IncompatibleFormat { .. } => {
                if self.metrics.mark_degraded() {
                    warn!(
                        code = err.code(),
                        error = %err,
                        "dedup index failed; deduplication disabled for this instance"
                    );
                }
                Ok(())
            }
        }
    }
}
