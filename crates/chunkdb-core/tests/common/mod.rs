#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chunkdb_core::{BlobBackend, BlobId, Cancellation, ChunkDigest, ChunkRequest, ChunkSource, Compression};
use flate2::write::GzEncoder;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Deterministic chunk content that differs per `seed`.
pub fn chunk(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8))
        .collect()
}

/// One image layer blob plus the chunk table the runtime would read from it.
pub struct Layer {
    pub blob_id: BlobId,
    pub bytes: Vec<u8>,
    pub requests: Vec<ChunkRequest>,
}

impl Layer {
    pub fn build(name: &str, chunks: &[Vec<u8>], compression: Compression) -> Result<Self> {
        let blob_id = BlobId::new(name)?;
        let mut bytes = Vec::new();
        let mut requests = Vec::new();
        for plaintext in chunks {
            let stored = match compression {
                Compression::None => plaintext.clone(),
                Compression::Gzip => gzip(plaintext)?,
            };
            requests.push(ChunkRequest {
                digest: ChunkDigest::compute(plaintext),
                expected_size: plaintext.len() as u64,
                source: ChunkSource {
                    blob_id: blob_id.clone(),
                    offset: bytes.len() as u64,
                    compressed_size: stored.len() as u64,
                    compression,
                },
            });
            bytes.extend_from_slice(&stored);
        }
        Ok(Self {
            blob_id,
            bytes,
            requests,
        })
    }
}

/// In-memory stand-in for the registry backend.
#[derive(Default)]
pub struct ImageBackend {
    blobs: HashMap<BlobId, Vec<u8>>,
    calls: AtomicUsize,
    delay: Duration,
    corrupt_remaining: AtomicUsize,
    cancel_during_fetch: AtomicBool,
}

impl ImageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_layer(mut self, layer: &Layer) -> Self {
        self.blobs.insert(layer.blob_id.clone(), layer.bytes.clone());
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Flip a byte in the next `count` responses.
    #[must_use]
    pub fn corrupting(self, count: usize) -> Self {
        self.corrupt_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Cancel the caller's token while the next fetch is in progress.
    pub fn cancel_next_fetch(&self) {
        self.cancel_during_fetch.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BlobBackend for ImageBackend {
    fn fetch(
        &self,
        blob_id: &BlobId,
        offset: u64,
        size: u64,
        cancel: &Cancellation,
    ) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.cancel_during_fetch.swap(false, Ordering::SeqCst) {
            cancel.cancel();
        }
        let blob = self
            .blobs
            .get(blob_id)
            .with_context(|| format!("blob {blob_id} not found"))?;
        let start = usize::try_from(offset)?;
        let end = start + usize::try_from(size)?;
        if end > blob.len() {
            bail!("range {start}..{end} beyond blob {blob_id}");
        }
        let mut bytes = blob[start..end].to_vec();
        if self
            .corrupt_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            if let Some(first) = bytes.first_mut() {
                *first ^= 0x55;
            }
        }
        Ok(bytes)
    }
}
