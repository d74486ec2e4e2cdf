use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::IndexOptions;

pub const ENV_DEDUP_DB: &str = "CHUNKDB_DEDUP_DB";
pub const ENV_VERIFY_HITS: &str = "CHUNKDB_VERIFY_HITS";
pub const ENV_LOCK_TIMEOUT_MS: &str = "CHUNKDB_LOCK_TIMEOUT_MS";
pub const ENV_BUSY_TIMEOUT_MS: &str = "CHUNKDB_BUSY_TIMEOUT_MS";
pub const ENV_INTEGRITY_RETRIES: &str = "CHUNKDB_INTEGRITY_RETRIES";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_INTEGRITY_RETRIES: u32 = 1;

/// Point-in-time copy of the process environment.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    #[must_use]
    pub fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn flag_is_enabled(&self, key: &str) -> bool {
        self.var(key).is_some_and(|value| {
            let lowered = value.trim().to_ascii_lowercase();
            !matches!(lowered.as_str(), "" | "0" | "false" | "no" | "off")
        })
    }
}

/// Whether a dedup hit re-checks bytes before it is served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitVerification {
    /// Trust the record: its bytes were verified when it was committed.
    #[default]
    TrustMetadata,
    /// Read the chunk from the registered local blob copy and verify it.
    VerifyLocalBytes,
}

/// Settings for the dedup layer, embeddable in the runtime's JSON config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Database path. Absent or empty disables deduplication.
    pub database: Option<PathBuf>,
    pub hit_verification: HitVerification,
    pub lock_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    /// Extra backend fetches after an integrity mismatch.
    pub integrity_retries: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            database: None,
            hit_verification: HitVerification::TrustMetadata,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            integrity_retries: DEFAULT_INTEGRITY_RETRIES,
        }
    }
}

impl DedupConfig {
    #[must_use]
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database: Some(path.into()),
            ..Self::default()
        }
    }

    /// Builds a configuration from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a numeric setting cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database: snapshot
                .var(ENV_DEDUP_DB)
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            hit_verification: if snapshot.flag_is_enabled(ENV_VERIFY_HITS) {
                HitVerification::VerifyLocalBytes
            } else {
                HitVerification::TrustMetadata
            },
            lock_timeout_ms: parse_number(snapshot, ENV_LOCK_TIMEOUT_MS)?
                .unwrap_or(defaults.lock_timeout_ms),
            busy_timeout_ms: parse_number(snapshot, ENV_BUSY_TIMEOUT_MS)?
                .unwrap_or(defaults.busy_timeout_ms),
            integrity_retries: parse_number(snapshot, ENV_INTEGRITY_RETRIES)?
                .unwrap_or(defaults.integrity_retries),
        })
    }

    /// The configured database path, if dedup is enabled.
    pub fn database_path(&self) -> Option<&Path> {
        self.database
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn is_enabled(&self) -> bool {
        self.database_path().is_some()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            busy_timeout: self.busy_timeout(),
        }
    }
}

fn parse_number<T>(snapshot: &EnvSnapshot, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    snapshot
        .var(key)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("invalid value for {key}: '{value}'"))
        })
        .transpose()
}
