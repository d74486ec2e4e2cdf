use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::DomainError;

/// Width in bytes of every chunk digest.
pub const DIGEST_LEN: usize = 32;

/// The content address of a chunk: SHA-256 over its uncompressed bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkDigest([u8; DIGEST_LEN]);

impl ChunkDigest {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash `plaintext` with the digest function index keys are defined over.
    #[must_use]
    pub fn compute(plaintext: &[u8]) -> Self {
        Self(Sha256::digest(plaintext).into())
    }

    pub fn from_hex(value: &str) -> Result<Self, DomainError> {
        if value.len() != DIGEST_LEN * 2 {
            return Err(DomainError::InvalidDigest {
                value: value.to_string(),
                reason: format!("expected {} hex characters, found {}", DIGEST_LEN * 2, value.len()),
            });
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(value, &mut bytes).map_err(|err| DomainError::InvalidDigest {
            value: value.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkDigest(sha256:{})", self.to_hex())
    }
}

impl FromStr for ChunkDigest {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ChunkDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}
