//! Cross-process advisory locks, striped by digest.
//!
//! Every process sharing a database path also shares `<db>.locks/`, a fixed
//! set of lock files. A digest maps to one stripe, so two processes resolving
//! the same chunk serialize on the same file. Threads of one process share an
//! already-held stripe instead of queueing behind each other; same-digest
//! callers inside a process are serialized by the flight map.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chunkdb_domain::ChunkDigest;
use fs4::FileExt;
use tracing::debug;

pub(crate) const STRIPE_COUNT: usize = 64;

#[derive(Debug)]
struct HeldStripe {
    _file: File,
    stripe: usize,
}

/// Keeps one stripe locked until every clone is dropped.
#[derive(Debug, Clone)]
pub(crate) struct StripeLock {
    held: Arc<HeldStripe>,
}

impl StripeLock {
    pub(crate) fn stripe(&self) -> usize {
        self.held.stripe
    }
}

#[derive(Debug)]
pub(crate) struct StripeLocks {
    dir: PathBuf,
    held: Mutex<HashMap<usize, Weak<HeldStripe>>>,
}

impl StripeLocks {
    pub(crate) fn for_database(database: &Path) -> Self {
        let name = database
            .file_name()
            .map_or_else(|| "chunkdb".into(), |name| name.to_string_lossy().into_owned());
        Self {
            dir: database.with_file_name(format!("{name}.locks")),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn stripe_for(digest: &ChunkDigest) -> usize {
        usize::from(digest.as_bytes()[0]) % STRIPE_COUNT
    }

    fn lock_path(&self, stripe: usize) -> PathBuf {
        self.dir.join(format!("{stripe:02}.lock"))
    }

    /// Take the stripe for `digest` without blocking.
    ///
    /// `Ok(None)` means another process holds it.
    pub(crate) fn try_acquire(&self, digest: &ChunkDigest) -> io::Result<Option<StripeLock>> {
        let stripe = Self::stripe_for(digest);
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = held.get(&stripe).and_then(Weak::upgrade) {
            return Ok(Some(StripeLock { held: existing }));
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(stripe);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(stripe, path = %path.display(), "acquired dedup stripe lock");
                let lock = Arc::new(HeldStripe { _file: file, stripe });
                held.insert(stripe, Arc::downgrade(&lock));
                Ok(Some(StripeLock { held: lock }))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn digest_with_first_byte(first: u8) -> ChunkDigest {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        ChunkDigest::from_bytes(bytes)
    }

    #[test]
    fn lock_files_live_next_to_the_database() {
        let locks = StripeLocks::for_database(Path::new("/var/lib/chunkdb/cas-1.db"));
        assert_eq!(
            locks.lock_path(7),
            PathBuf::from("/var/lib/chunkdb/cas-1.db.locks/07.lock")
        );
        assert_eq!(StripeLocks::stripe_for(&digest_with_first_byte(65)), 1);
    }

    #[test]
    fn threads_share_a_held_stripe() -> Result<()> {
        let temp = tempdir()?;
        let locks = StripeLocks::for_database(&temp.path().join("cas.db"));
        let first = locks
            .try_acquire(&digest_with_first_byte(3))?
            .expect("stripe free");
        let second = locks
            .try_acquire(&digest_with_first_byte(67))?
            .expect("shared in-process");
        assert_eq!(first.stripe(), second.stripe());
        assert!(Arc::ptr_eq(&first.held, &second.held));
        Ok(())
    }

    #[test]
    fn separate_lock_sets_exclude_each_other() -> Result<()> {
        // Two handles on the same directory stand in for two processes.
        let temp = tempdir()?;
        let db = temp.path().join("cas.db");
        let ours = StripeLocks::for_database(&db);
        let theirs = StripeLocks::for_database(&db);
        let digest = digest_with_first_byte(9);

        let held = ours.try_acquire(&digest)?.expect("stripe free");
        assert!(theirs.try_acquire(&digest)?.is_none());
        assert!(theirs.try_acquire(&digest_with_first_byte(10))?.is_some());
        drop(held);
        assert!(theirs.try_acquire(&digest)?.is_some());
        Ok(())
    }
}
