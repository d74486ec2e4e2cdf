//! Persistent digest index.
//!
//! The index is a SQLite database in WAL mode so every runtime instance
//! configured with the same path (in this process or another one) can open it
//! concurrently. Readers never see a half-committed row; writers serialize on
//! SQLite's own file locks. Each handle keeps a separate read connection, so
//! lookups are served from the WAL snapshot while a write waits on another
//! process. The `chunks` table is append-only: the only
//! statement that writes it is `INSERT OR IGNORE`, so the first commit for a
//! digest is authoritative for the lifetime of the file.
//!
//! The code is split by responsibility:
//! - connection + transaction helpers: `connection.rs`
//! - DDL: `schema.rs`
//! - format/version markers: `meta.rs`
//! - open-time validation: `health.rs`
//! - chunk records: `chunks.rs`
//! - local blob copies: `blobs.rs`
//! - read-only verification sweep: `audit.rs`

use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chunkdb_domain::{BlobId, ChunkDigest, ChunkRecord, Compression};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

mod audit;
mod blobs;
mod chunks;
mod connection;
mod health;
mod meta;
mod schema;

pub use audit::AuditSummary;

const FORMAT_VERSION: u32 = 1;
const SCHEMA_VERSION: u32 = 1;
const META_KEY_FORMAT_VERSION: &str = "format_version";
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
const META_KEY_CREATED_BY: &str = "created_by_version";
const META_KEY_LAST_USED: &str = "last_used_version";
const CHUNKDB_VERSION: &str = env!("CARGO_PKG_VERSION");
const REQUIRED_TABLES: [&str; 3] = ["meta", "chunks", "blobs"];

/// Errors surfaced by the digest index.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[CD810] dedup index storage failure at {path}: {reason}")]
    IoFatal { path: String, reason: String },
    #[error("[CD811] dedup index at {path} is corrupt: {reason}")]
    Corruption { path: String, reason: String },
    #[error("[CD812] dedup index metadata is missing required key '{0}'")]
    MissingMeta(String),
    #[error("[CD812] dedup index format incompatible for {key}: expected {expected}, found {found}")]
    IncompatibleFormat {
        key: String,
        expected: String,
        found: String,
    },
    #[error("[CD813] dedup index at {path} is busy: {reason}")]
    Busy { path: String, reason: String },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::IoFatal { .. } => "CD810",
            Self::Corruption { .. } => "CD811",
            Self::MissingMeta(_) | Self::IncompatibleFormat { .. } => "CD812",
            Self::Busy { .. } => "CD813",
        }
    }

    /// Whether dedup can carry on as if the index were empty.
    ///
    /// Only storage-medium failures are fatal; everything else merely makes
    /// deduplication inert.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::IoFatal { .. })
    }

    fn corruption(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corruption {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn io_fatal(path: &Path, reason: impl Into<String>) -> Self {
        Self::IoFatal {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// Map a SQLite failure onto the index's recoverable/fatal split.
fn classify_sqlite(path: &Path, err: rusqlite::Error) -> StoreError {
    let reason = err.to_string();
    let path_text = path.display().to_string();
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy {
                path: path_text,
                reason,
            },
            ErrorCode::CannotOpen
            | ErrorCode::PermissionDenied
            | ErrorCode::ReadOnly
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::NotFound
            | ErrorCode::OutOfMemory
            | ErrorCode::NoLargeFileSupport => StoreError::IoFatal {
                path: path_text,
                reason,
            },
            _ => StoreError::Corruption {
                path: path_text,
                reason,
            },
        },
        _ => StoreError::Corruption {
            path: path_text,
            reason,
        },
    }
}

pub(crate) fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexOptions {
    /// How long a statement waits on another writer before reporting busy.
    pub busy_timeout: Duration,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct IndexStats {
    pub chunks: u64,
    pub blobs: u64,
    pub format_version: u32,
}

/// Handle on an open dedup database. Each runtime instance owns its own.
pub struct DigestIndex {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl fmt::Debug for DigestIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestIndex")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DigestIndex {
    /// Open the index at `path`, creating an empty versioned store when the
    /// file does not exist yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::IoFatal`] when the location is unusable; a recoverable
    /// variant when the file exists but cannot be trusted.
    pub fn open(path: impl Into<PathBuf>, options: &IndexOptions) -> Result<Self, StoreError> {
        let path = path.into();
        ensure_location(&path)?;
        let preexisting = fs::metadata(&path).is_ok_and(|meta| meta.len() > 0);
        let writer = Self::connection_raw(&path, options)?;
        let reader = Self::reader_raw(&path, options)?;
        let index = Self {
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        };
        if preexisting {
            index.run_quick_check()?;
        }
        index.init_schema()?;
        index.validate()?;
        index.record_last_used_version()?;
        debug!(path = %index.path.display(), preexisting, "dedup index opened");
        Ok(index)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the handle. Data stays on disk.
    pub fn close(self) -> Result<(), StoreError> {
        let path = self.path;
        let reader = self.reader.into_inner().unwrap_or_else(PoisonError::into_inner);
        let writer = self.writer.into_inner().unwrap_or_else(PoisonError::into_inner);
        reader.close().map_err(|(_, err)| classify_sqlite(&path, err))?;
        writer.close().map_err(|(_, err)| classify_sqlite(&path, err))
    }

    /// Connection for transactions and open-time checks.
    fn writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Query-only connection; never queued behind a pending write.
    fn reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn classify(&self, err: rusqlite::Error) -> StoreError {
        classify_sqlite(&self.path, err)
    }
}

fn ensure_location(path: &Path) -> Result<(), StoreError> {
    if path.is_dir() {
        return Err(StoreError::io_fatal(path, "path is a directory"));
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => Err(
            StoreError::io_fatal(path, format!("parent directory {} does not exist", parent.display())),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests;
