//! Concurrency control around a single digest's miss path.
//!
//! Two layers: an in-process flight map so only one thread per digest runs
//! the fetch, and a striped file lock so only one process per digest does.
//! Neither layer is required for correctness, since index commits are
//! first-writer-wins; they exist so duplicate work is rare.

mod flight;
mod stripes;

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use chunkdb_domain::ChunkDigest;
use rand::{thread_rng, Rng};
use tracing::warn;

use crate::cancel::Cancellation;

pub(crate) use flight::{FlightWait, Join};
pub(crate) use stripes::StripeLock;

use flight::FlightMap;
use stripes::StripeLocks;

pub(crate) enum StripeAttempt {
    Acquired(StripeLock),
    /// No database path, so nothing to coordinate across processes.
    Disabled,
    TimedOut,
    Unavailable(String),
    Cancelled,
}

pub(crate) struct ConcurrencyGuard<T> {
    flights: FlightMap<ChunkDigest, T>,
    stripes: Option<StripeLocks>,
    timeout: Duration,
}

impl<T> ConcurrencyGuard<T> {
    pub(crate) fn new(database: Option<&Path>, timeout: Duration) -> Self {
        Self {
            flights: FlightMap::new(),
            stripes: database.map(StripeLocks::for_database),
            timeout,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Become the leader for `digest` or follow the one already running.
    pub(crate) fn join(&self, digest: &ChunkDigest) -> Join<'_, ChunkDigest, T> {
        self.flights.join(digest)
    }

    /// Take the cross-process stripe for `digest`, polling with jitter until
    /// the lock timeout or the caller's deadline.
    pub(crate) fn lock_stripe(&self, digest: &ChunkDigest, cancel: &Cancellation) -> StripeAttempt {
        let Some(stripes) = &self.stripes else {
            return StripeAttempt::Disabled;
        };
        let deadline = Instant::now() + self.timeout;
        let mut rng = thread_rng();
        loop {
            if cancel.is_cancelled() {
                return StripeAttempt::Cancelled;
            }
            match stripes.try_acquire(digest) {
                Ok(Some(lock)) => return StripeAttempt::Acquired(lock),
                Ok(None) => {}
                Err(err) => {
                    warn!(digest = %digest, error = %err, "dedup lock directory unusable");
                    return StripeAttempt::Unavailable(err.to_string());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return StripeAttempt::TimedOut;
            }
            let jitter = Duration::from_millis(rng.gen_range(2..=10));
            let wake = cancel.clamp(deadline).min(now + jitter);
            thread::sleep(wake.saturating_duration_since(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn without_a_database_stripes_are_disabled() {
        let guard: ConcurrencyGuard<()> = ConcurrencyGuard::new(None, Duration::from_millis(10));
        let digest = ChunkDigest::compute(b"x");
        assert!(matches!(
            guard.lock_stripe(&digest, &Cancellation::new()),
            StripeAttempt::Disabled
        ));
    }

    #[test]
    fn contended_stripe_times_out() -> Result<()> {
        let temp = tempdir()?;
        let db = temp.path().join("cas.db");
        let holder: ConcurrencyGuard<()> = ConcurrencyGuard::new(Some(&db), Duration::from_secs(1));
        let waiter: ConcurrencyGuard<()> =
            ConcurrencyGuard::new(Some(&db), Duration::from_millis(50));
        let digest = ChunkDigest::compute(b"contended");

        let StripeAttempt::Acquired(_held) = holder.lock_stripe(&digest, &Cancellation::new())
        else {
            panic!("first guard should get the stripe");
        };
        let started = Instant::now();
        assert!(matches!(
            waiter.lock_stripe(&digest, &Cancellation::new()),
            StripeAttempt::TimedOut
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));

        let cancel = Cancellation::with_timeout(Duration::from_millis(20));
        let long_waiter: ConcurrencyGuard<()> =
            ConcurrencyGuard::new(Some(&db), Duration::from_secs(30));
        assert!(matches!(
            long_waiter.lock_stripe(&digest, &cancel),
            StripeAttempt::Cancelled
        ));
        Ok(())
    }

    #[test]
    fn unusable_lock_directory_is_reported() -> Result<()> {
        let temp = tempdir()?;
        let db = temp.path().join("cas.db");
        std::fs::write(temp.path().join("cas.db.locks"), b"not a directory")?;
        let guard: ConcurrencyGuard<()> = ConcurrencyGuard::new(Some(&db), Duration::from_secs(1));
        assert!(matches!(
            guard.lock_stripe(&ChunkDigest::compute(b"x"), &Cancellation::new()),
            StripeAttempt::Unavailable(_)
        ));
        Ok(())
    }
}
