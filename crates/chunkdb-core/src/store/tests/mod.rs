//! Digest index unit tests, split by topic.

use super::*;
use anyhow::Result;
use std::sync::Arc;
use std::thread;
use tempfile::{tempdir, TempDir};


fn open_temp() -> Result<(TempDir, DigestIndex)> {
    let temp = tempdir()?;
    let index = DigestIndex::open(temp.path().join("cas-dedup.db"), &IndexOptions::default())?;
    Ok((temp, index))
}

fn record(data: &[u8], blob: &str, offset: u64) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        digest: ChunkDigest::compute(data),
        blob_id: BlobId::new(blob)?,
        offset,
        compressed_size: data.len() as u64,
        uncompressed_size: data.len() as u64,
        compression: Compression::None,
        first_seen_at: timestamp_secs(),
    })
}
