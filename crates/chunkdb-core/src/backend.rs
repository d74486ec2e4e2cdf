//! Seam to the remote blob backend.
//!
//! The protocol behind [`BlobBackend`] belongs to the runtime. This module only
//! fixes the contract the resolver calls and the counters every backend read
//! must be visible through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chunkdb_domain::BlobId;
use serde::{Deserialize, Serialize};

use crate::cancel::Cancellation;

/// Reads raw (possibly compressed) byte ranges from backend blobs.
pub trait BlobBackend: Send + Sync {
    /// Read `size` bytes at `offset` of `blob_id`.
    ///
    /// Implementations should poll `cancel` during long transfers and bail out
    /// once it reports cancellation.
    fn fetch(
        &self,
        blob_id: &BlobId,
        offset: u64,
        size: u64,
        cancel: &Cancellation,
    ) -> Result<Vec<u8>>;

    /// Called when a read is failed for a reason the backend could not see,
    /// such as bytes that never verified.
    fn record_read_error(&self) {}
}

impl<T: BlobBackend + ?Sized> BlobBackend for Arc<T> {
    fn fetch(
        &self,
        blob_id: &BlobId,
        offset: u64,
        size: u64,
        cancel: &Cancellation,
    ) -> Result<Vec<u8>> {
        (**self).fetch(blob_id, offset, size, cancel)
    }

    fn record_read_error(&self) {
        (**self).record_read_error();
    }
}

/// Cumulative backend read counters since process start.
#[derive(Debug, Default)]
pub struct BackendMetrics {
    read_count: AtomicU64,
    read_amount_total: AtomicU64,
    read_errors: AtomicU64,
}

/// Serialized form of [`BackendMetrics`], shaped like the runtime's
/// `/api/v1/metrics/backend` response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetricsSnapshot {
    pub read_count: u64,
    pub read_amount_total: u64,
    pub read_errors: u64,
}

impl BackendMetrics {
    pub fn snapshot(&self) -> BackendMetricsSnapshot {
        BackendMetricsSnapshot {
            read_count: self.read_count.load(Ordering::Relaxed),
            read_amount_total: self.read_amount_total.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }

    fn record_read(&self, bytes: u64) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_amount_total.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl BackendMetricsSnapshot {
    /// Counters accumulated after `earlier` was taken.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            read_count: self.read_count.saturating_sub(earlier.read_count),
            read_amount_total: self
                .read_amount_total
                .saturating_sub(earlier.read_amount_total),
            read_errors: self.read_errors.saturating_sub(earlier.read_errors),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "read_count": self.read_count,
            "read_amount_total": self.read_amount_total,
            "read_errors": self.read_errors,
        })
    }
}

/// Wraps a backend so every invocation is counted.
#[derive(Debug)]
pub struct MeteredBackend<B> {
    inner: B,
    metrics: Arc<BackendMetrics>,
}

impl<B: BlobBackend> MeteredBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            metrics: Arc::default(),
        }
    }

    /// Shared handle for whoever serves the metrics endpoint.
    pub fn metrics(&self) -> Arc<BackendMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: BlobBackend> BlobBackend for MeteredBackend<B> {
    fn fetch(
        &self,
        blob_id: &BlobId,
        offset: u64,
        size: u64,
        cancel: &Cancellation,
    ) -> Result<Vec<u8>> {
        match self.inner.fetch(blob_id, offset, size, cancel) {
            Ok(bytes) => {
                self.metrics.record_read(bytes.len() as u64);
                Ok(bytes)
            }
            // An aborted read is the caller's doing, not the backend's.
            Err(err) if cancel.is_cancelled() => Err(err),
            Err(err) => {
                self.metrics.record_read(0);
                self.metrics.record_error();
                Err(err)
            }
        }
    }

    fn record_read_error(&self) {
        self.metrics.record_error();
        self.inner.record_read_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Fixed(Vec<u8>);

    impl BlobBackend for Fixed {
        fn fetch(
            &self,
            _blob_id: &BlobId,
            offset: u64,
            size: u64,
            _cancel: &Cancellation,
        ) -> Result<Vec<u8>> {
            let start = usize::try_from(offset)?;
            let end = start + usize::try_from(size)?;
            if end > self.0.len() {
                bail!("range {start}..{end} out of bounds");
            }
            Ok(self.0[start..end].to_vec())
        }
    }

    #[test]
    fn counts_reads_bytes_and_errors() -> Result<()> {
        let backend = MeteredBackend::new(Fixed(vec![7u8; 64]));
        let blob = BlobId::new("blob")?;
        let cancel = Cancellation::new();

        backend.fetch(&blob, 0, 16, &cancel)?;
        backend.fetch(&blob, 16, 32, &cancel)?;
        assert!(backend.fetch(&blob, 60, 16, &cancel).is_err());

        let snapshot = backend.metrics().snapshot();
        assert_eq!(
            snapshot,
            BackendMetricsSnapshot {
                read_count: 3,
                read_amount_total: 48,
                read_errors: 1,
            }
        );
        Ok(())
    }

    struct Aborting;

    impl BlobBackend for Aborting {
        fn fetch(
            &self,
            _blob_id: &BlobId,
            _offset: u64,
            _size: u64,
            cancel: &Cancellation,
        ) -> Result<Vec<u8>> {
            cancel.cancel();
            bail!("read aborted")
        }
    }

    #[test]
    fn cancelled_reads_are_not_backend_errors() -> Result<()> {
        let backend = MeteredBackend::new(Aborting);
        let blob = BlobId::new("blob")?;
        assert!(backend.fetch(&blob, 0, 16, &Cancellation::new()).is_err());
        assert_eq!(backend.metrics().snapshot(), BackendMetricsSnapshot::default());
        Ok(())
    }

    #[test]
    fn snapshot_json_matches_endpoint_shape() -> Result<()> {
        let snapshot = BackendMetricsSnapshot {
            read_count: 2,
            read_amount_total: 8192,
            read_errors: 0,
        };
        let parsed: BackendMetricsSnapshot = serde_json::from_value(snapshot.to_json())?;
        assert_eq!(parsed, snapshot);
        assert_eq!(snapshot.to_json()["read_amount_total"], 8192);
        Ok(())
    }

    #[test]
    fn since_subtracts_an_earlier_snapshot() {
        let earlier = BackendMetricsSnapshot {
            read_count: 3,
            read_amount_total: 100,
            read_errors: 1,
        };
        let later = BackendMetricsSnapshot {
            read_count: 5,
            read_amount_total: 160,
            read_errors: 1,
        };
        assert_eq!(
            later.since(&earlier),
            BackendMetricsSnapshot {
                read_count: 2,
                read_amount_total: 60,
                read_errors: 0,
            }
        );
    }
}
