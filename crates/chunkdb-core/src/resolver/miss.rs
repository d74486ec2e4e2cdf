//! The miss path: lead a flight, fetch, verify, commit.

use super::*;
use crate::verify::{verify_chunk, IntegrityFailure};

impl<B: BlobBackend> ChunkResolver<B> {
    pub(super) fn lead(
        &self,
        request: &ChunkRequest,
        cancel: &Cancellation,
    ) -> Result<Resolved, DedupError> {
        let stripe = match self.guard.lock_stripe(&request.digest, cancel) {
            StripeAttempt::Acquired(lock) => {
                debug!(digest = %request.digest, stripe = lock.stripe(), "holding dedup stripe");
                Some(lock)
            }
            StripeAttempt::Disabled => None,
            StripeAttempt::Unavailable(reason) => {
                debug!(digest = %request.digest, %reason, "fetching without the cross-process lock");
                None
            }
            StripeAttempt::Cancelled => return Err(DedupError::Cancelled),
            StripeAttempt::TimedOut => {
                self.metrics.lock_timeout();
                let err = DedupError::LockTimeout {
                    digest: request.digest,
                };
                warn!(digest = %request.digest, error = %err, "fetching without the cross-process lock");
                None
            }
        };
        // Whoever held the stripe before us may have committed this digest.
        let outcome = match self.try_hit(request)? {
            Some(hit) => Ok(hit),
            None => self.fetch_and_commit(request, cancel),
        };
        drop(stripe);
        outcome
    }

    pub(super) fn fetch_and_commit(
        &self,
        request: &ChunkRequest,
        cancel: &Cancellation,
    ) -> Result<Resolved, DedupError> {
        let source = &request.source;
        let attempts = self.config.integrity_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel.check()?;
            self.metrics.fetch();
            let raw = match self.backend.fetch(
                &source.blob_id,
                source.offset,
                source.compressed_size,
                cancel,
            ) {
                Ok(raw) => raw,
                Err(_) if cancel.is_cancelled() => return Err(DedupError::Cancelled),
                Err(err) => {
                    let err = DedupError::BackendFetch {
                        blob_id: source.blob_id.clone(),
                        offset: source.offset,
                        message: format!("{err:#}"),
                    };
                    warn!(digest = %request.digest, error = %err, "backend fetch failed");
                    return Err(err);
                }
            };
            // Bytes that arrive after cancellation are dropped, never committed.
            cancel.check()?;

            let verified = if raw.len() as u64 == source.compressed_size {
                verify_chunk(
                    &request.digest,
                    source.compression,
                    raw,
                    request.expected_size,
                )
            } else {
                Err(IntegrityFailure::SizeMismatch {
                    expected: source.compressed_size,
                    found: raw.len() as u64,
                })
            };
            match verified {
                Ok(plaintext) => {
                    let committed = self.commit(request)?;
                    return Ok(Resolved::Fetched {
                        location: request.source_location(),
                        data: Arc::from(plaintext),
                        committed,
                    });
                }
                Err(failure) => {
                    self.metrics.integrity_failure();
                    warn!(
                        digest = %request.digest,
                        blob = %source.blob_id,
                        attempt,
                        attempts,
                        %failure,
                        "fetched chunk failed verification"
                    );
                    if attempt >= attempts {
                        self.backend.record_read_error();
                        return Err(DedupError::IntegrityMismatch {
                            digest: request.digest,
                            attempts,
                            failure,
                        });
                    }
                }
            }
        }
    }

    fn commit(&self, request: &ChunkRequest) -> Result<bool, DedupError> {
        let Some(index) = self.active_index() else {
            return Ok(false);
        };
        match index.put_if_absent(&request.to_record(timestamp_secs())) {
            Ok(true) => {
                self.metrics.commit();
                Ok(true)
            }
            Ok(false) => {
                self.metrics.duplicate_commit();
                debug!(digest = %request.digest, "chunk already committed by another writer");
                Ok(false)
            }
            Err(err) => {
                self.absorb(err)?;
                Ok(false)
            }
        }
    }
}
