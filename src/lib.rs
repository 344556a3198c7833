//! Project Sync
//!
//! An offline-first sync engine with:
//! - SQLite local cache with per-row sync status and parent/child integrity
//! - Write-through repositories that never block on the network
//! - Full-snapshot remote subscriptions fanned into one readiness signal
//! - Transactional reconciliation with a dependency retry queue

pub mod connectivity;
pub mod error;
pub mod events;
pub mod identity;
pub mod models;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use error::{RemoteError, StoreError, SyncError};
pub use sync::{SyncEngine, SyncState};

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub store: StoreYamlConfig,
    pub sync: SyncYamlConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
}

/// Local store section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreYamlConfig {
    pub db_path: PathBuf,
}

impl Default for StoreYamlConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/sync.db"),
        }
    }
}

/// Background flush section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncYamlConfig {
    pub flush_interval_secs: u64,
}

impl Default for SyncYamlConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
        }
    }
}

/// Backoff for writes rejected by a missing parent row
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

/// Eviction of queued children whose parent never arrives
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_drain_attempts: u32,
    pub orphan_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_drain_attempts: 50,
            orphan_ttl_secs: 86_400,
        }
    }
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub flush_interval_secs: u64,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        let yaml = YamlConfig::default();
        Self {
            db_path: yaml.store.db_path,
            flush_interval_secs: yaml.sync.flush_interval_secs,
            retry: yaml.retry,
            queue: yaml.queue,
        }
    }
}

fn env_or<T: FromStr>(var: &str, fallback: T) -> T {
    match std::env::var(var) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring unparsable {}={:?}", var, raw);
                fallback
            }
        },
        Err(_) => fallback,
    }
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);

        let config = Self {
            db_path: std::env::var("SYNC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(yaml.store.db_path),
            flush_interval_secs: env_or("SYNC_FLUSH_INTERVAL_SECS", yaml.sync.flush_interval_secs),
            retry: RetryConfig {
                max_attempts: env_or("SYNC_RETRY_MAX_ATTEMPTS", yaml.retry.max_attempts),
                base_delay_ms: env_or("SYNC_RETRY_BASE_DELAY_MS", yaml.retry.base_delay_ms),
                multiplier: yaml.retry.multiplier,
                max_delay_ms: env_or("SYNC_RETRY_MAX_DELAY_MS", yaml.retry.max_delay_ms),
            },
            queue: QueueConfig {
                max_drain_attempts: env_or(
                    "SYNC_QUEUE_MAX_DRAIN_ATTEMPTS",
                    yaml.queue.max_drain_attempts,
                ),
                orphan_ttl_secs: env_or("SYNC_QUEUE_ORPHAN_TTL_SECS", yaml.queue.orphan_ttl_secs),
            },
        };

        if config.flush_interval_secs == 0 {
            anyhow::bail!("flush interval must be at least one second");
        }
        Ok(config)
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
