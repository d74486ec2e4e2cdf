use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::verify::MAX_CHUNK_BYTES;

/// Read `len` bytes at `offset` from a locally kept blob copy.
pub(crate) fn read_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    if len > MAX_CHUNK_BYTES {
        bail!(
            "refusing to read {len} bytes from {}: larger than any chunk",
            path.display()
        );
    }
    let mut file = File::open(path)
        .with_context(|| format!("failed to open local blob copy {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("failed to seek local blob copy {}", path.display()))?;
    let mut buf = vec![0u8; usize::try_from(len)?];
    file.read_exact(&mut buf).with_context(|| {
        format!(
            "failed to read {len} bytes at offset {offset} of {}",
            path.display()
        )
    })?;
    Ok(buf)
}

/// Whether `err` was caused by the local copy not existing.
pub(crate) fn is_missing(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
    })
}
