//! Configuration file
//!
//! All sections are optional; missing fields fall back to the defaults of
//! [`RaceConfig`], [`SnapshotConfig`] and [`FailoverConfig`]. Durations are
//! written in milliseconds.
//!
//! ```json
//! {
//!   "state_dir": "/var/lib/tether",
//!   "marketplace": { "base_url": "https://market.example/api/v0" },
//!   "storage": { "kind": "s3", "bucket": "tether-snapshots", "prefix": "prod" },
//!   "workspace": { "kind": "exec", "workdir": "/workspace" },
//!   "race": { "batch_size": 4, "boot_stage_timeout": 15000 },
//!   "failover": { "probe_interval": 5000, "failure_threshold": 3 }
//! }
//! ```

use crate::error::{OrchestratorError, Result};
use crate::failover::FailoverConfig;
use crate::race::RaceConfig;
use crate::snapshot::SnapshotConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable holding the marketplace API key by default
pub const DEFAULT_API_KEY_ENV: &str = "TETHER_API_KEY";

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Marketplace REST endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    pub base_url: String,

    /// Name of the environment variable holding the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: std::time::Duration,
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_request_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/v0".to_string(),
            api_key_env: default_api_key_env(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Where snapshot chunks are stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process memory (lost on exit)
    Memory,
    /// Directory tree on local disk
    Local { dir: PathBuf },
    /// AWS S3 bucket
    S3 {
        bucket: String,
        #[serde(default = "default_s3_prefix")]
        prefix: String,
        #[serde(default)]
        region: Option<String>,
    },
}

fn default_s3_prefix() -> String {
    "snapshots".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            dir: PathBuf::from(".tether/chunks"),
        }
    }
}

/// How working directories are archived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkspaceConfig {
    /// `tar` over the marketplace exec channel
    Exec { workdir: String },
    /// Working directories mounted locally under `root/<resource id>`
    Local { root: PathBuf },
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self::Exec {
            workdir: "/workspace".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Directory holding persisted workload records
    pub state_dir: Option<PathBuf>,
    pub marketplace: MarketplaceConfig,
    pub storage: StorageConfig,
    pub workspace: WorkspaceConfig,
    pub race: RaceConfig,
    pub snapshot: SnapshotConfig,
    pub failover: FailoverConfig,
}

impl TetherConfig {
    /// Load from a JSON file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            debug!("No config file given, using defaults");
            return Ok(Self::default());
        };

        debug!(path = %path.display(), "Loading config");
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.race.batch_size == 0 || self.race.max_batches == 0 {
            return Err(OrchestratorError::config(
                "race.batch_size and race.max_batches must be at least 1",
            ));
        }
        if self.snapshot.chunk_count == 0 || self.snapshot.workers == 0 {
            return Err(OrchestratorError::config(
                "snapshot.chunk_count and snapshot.workers must be at least 1",
            ));
        }
        if self.failover.failure_threshold == 0 {
            return Err(OrchestratorError::config(
                "failover.failure_threshold must be at least 1",
            ));
        }
        Ok(())
    }

    /// State directory, defaulting to `.tether/state`
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".tether/state"))
    }
}
