use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::ChunkDigest;
use crate::error::DomainError;

/// Identifier of a backend blob (one image layer's data object).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::EmptyBlobId);
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BlobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlobId> for String {
    fn from(value: BlobId) -> Self {
        value.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

/// How the bytes stored in a blob are encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
        }
    }
}

impl TryFrom<&str> for Compression {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            other => Err(DomainError::UnknownCompression(other.to_string())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a chunk lives in the backend blob of the layer being read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSource {
    pub blob_id: BlobId,
    pub offset: u64,
    pub compressed_size: u64,
    pub compression: Compression,
}

/// One chunk read issued by the filesystem read path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub digest: ChunkDigest,
    /// Uncompressed size the chunk table claims for this digest.
    pub expected_size: u64,
    pub source: ChunkSource,
}

impl ChunkRequest {
    /// Location of the chunk inside the requesting layer's own blob.
    #[must_use]
    pub fn source_location(&self) -> ChunkLocation {
        ChunkLocation {
            blob_id: self.source.blob_id.clone(),
            offset: self.source.offset,
            compressed_size: self.source.compressed_size,
            uncompressed_size: self.expected_size,
            compression: self.source.compression,
        }
    }

    /// The record committed for this chunk once its bytes are verified.
    #[must_use]
    pub fn to_record(&self, first_seen_at: u64) -> ChunkRecord {
        ChunkRecord {
            digest: self.digest,
            blob_id: self.source.blob_id.clone(),
            offset: self.source.offset,
            compressed_size: self.source.compressed_size,
            uncompressed_size: self.expected_size,
            compression: self.source.compression,
            first_seen_at,
        }
    }
}

/// A committed dedup index entry. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub digest: ChunkDigest,
    pub blob_id: BlobId,
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression: Compression,
    /// Unix seconds of the first commit. Diagnostic only.
    pub first_seen_at: u64,
}

impl ChunkRecord {
    /// Whether this record can be trusted for a read expecting `expected_size`
    /// uncompressed bytes.
    #[must_use]
    pub fn is_consistent_with(&self, expected_size: u64) -> bool {
        if self.uncompressed_size != expected_size || self.compressed_size == 0 {
            return false;
        }
        match self.compression {
            Compression::None => self.compressed_size == self.uncompressed_size,
            Compression::Gzip => true,
        }
    }

    #[must_use]
    pub fn location(&self) -> ChunkLocation {
        ChunkLocation {
            blob_id: self.blob_id.clone(),
            offset: self.offset,
            compressed_size: self.compressed_size,
            uncompressed_size: self.uncompressed_size,
            compression: self.compression,
        }
    }
}

/// Where the runtime should read a resolved chunk from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub blob_id: BlobId,
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression: Compression,
}
