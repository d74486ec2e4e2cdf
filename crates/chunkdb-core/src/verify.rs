//! Integrity checks for chunk bytes.
//!
//! A digest is always recomputed over the uncompressed bytes, the same input
//! index keys are defined over.

use std::io::Read;

use chunkdb_domain::{ChunkDigest, Compression};
use flate2::read::GzDecoder;

/// Upper bound on a single chunk, compressed or not.
pub const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IntegrityFailure {
    #[error("failed to decode {compression} chunk: {reason}")]
    Decode {
        compression: Compression,
        reason: String,
    },
    #[error("size mismatch (expected {expected} bytes, found {found})")]
    SizeMismatch { expected: u64, found: u64 },
    #[error("digest mismatch (expected {expected}, found {actual})")]
    DigestMismatch {
        expected: ChunkDigest,
        actual: ChunkDigest,
    },
}

/// Whether `plaintext` hashes to `digest`.
#[must_use]
pub fn verify(digest: &ChunkDigest, plaintext: &[u8]) -> bool {
    ChunkDigest::compute(plaintext) == *digest
}

/// Undo `compression`, producing at most `expected_size + 1` bytes so an
/// oversized stream is detected without being fully inflated.
pub fn decode(
    compression: Compression,
    raw: Vec<u8>,
    expected_size: u64,
) -> Result<Vec<u8>, IntegrityFailure> {
    match compression {
        Compression::None => Ok(raw),
        Compression::Gzip => {
            let limit = expected_size.min(MAX_CHUNK_BYTES).saturating_add(1);
            let mut plaintext = Vec::new();
            GzDecoder::new(raw.as_slice())
                .take(limit)
                .read_to_end(&mut plaintext)
                .map_err(|err| IntegrityFailure::Decode {
                    compression,
                    reason: err.to_string(),
                })?;
            Ok(plaintext)
        }
    }
}

/// Decode `raw` and check it is exactly the chunk `digest` names.
pub fn verify_chunk(
    digest: &ChunkDigest,
    compression: Compression,
    raw: Vec<u8>,
    expected_size: u64,
) -> Result<Vec<u8>, IntegrityFailure> {
    let plaintext = decode(compression, raw, expected_size)?;
    let found = plaintext.len() as u64;
    if found != expected_size {
        return Err(IntegrityFailure::SizeMismatch {
            expected: expected_size,
            found,
        });
    }
    let actual = ChunkDigest::compute(&plaintext);
    if actual != *digest {
        return Err(IntegrityFailure::DigestMismatch {
            expected: *digest,
            actual,
        });
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("compress");
        encoder.finish().expect("finish")
    }

    #[test]
    fn accepts_matching_plain_chunk() {
        let data = b"layer chunk contents".to_vec();
        let digest = ChunkDigest::compute(&data);
        assert!(verify(&digest, &data));
        let verified = verify_chunk(&digest, Compression::None, data.clone(), data.len() as u64)
            .expect("verified");
        assert_eq!(verified, data);
    }

    #[test]
    fn verifies_the_plaintext_of_gzip_chunks() {
        let data = vec![42u8; 4096];
        let digest = ChunkDigest::compute(&data);
        let verified =
            verify_chunk(&digest, Compression::Gzip, gzip(&data), 4096).expect("verified");
        assert_eq!(verified, data);
    }

    #[test]
    fn flags_flipped_bytes() {
        let data = vec![1u8; 512];
        let digest = ChunkDigest::compute(&data);
        let mut tampered = data.clone();
        tampered[100] ^= 0xff;
        assert!(!verify(&digest, &tampered));
        let failure = verify_chunk(&digest, Compression::None, tampered, 512).unwrap_err();
        assert!(matches!(failure, IntegrityFailure::DigestMismatch { .. }));
    }

    #[test]
    fn flags_short_and_oversized_chunks() {
        let data = vec![9u8; 300];
        let digest = ChunkDigest::compute(&data);
        assert_eq!(
            verify_chunk(&digest, Compression::None, data[..200].to_vec(), 300),
            Err(IntegrityFailure::SizeMismatch {
                expected: 300,
                found: 200,
            })
        );
        let oversized = gzip(&vec![9u8; 10_000]);
        assert_eq!(
            verify_chunk(&digest, Compression::Gzip, oversized, 300),
            Err(IntegrityFailure::SizeMismatch {
                expected: 300,
                found: 301,
            })
        );
    }

    #[test]
    fn garbage_gzip_is_a_decode_failure() {
        let digest = ChunkDigest::compute(b"x");
        let failure = verify_chunk(&digest, Compression::Gzip, b"not gzip".to_vec(), 1).unwrap_err();
        assert!(matches!(failure, IntegrityFailure::Decode { .. }));
    }
}
