//! Configuration for the sync server.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration apart from the token secret.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::access::Role;
use crate::error::ConfigError;
use crate::ids::{DocumentId, UserId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub persistence: PersistenceConfig,
    pub rooms: RoomConfig,
    pub auth: AuthConfig,
    pub workspaces: Vec<WorkspaceConfig>,
}

impl Config {
    /// Reads and parses a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks settings that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.token_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long an unreferenced document stays resident, so that a quick
    /// reconnect does not force a reload
    pub eviction_grace_ms: u64,
    /// Upper bound on waiting for a document to load
    pub load_timeout_ms: u64,
}

impl RegistryConfig {
    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            eviction_grace_ms: 30_000,
            load_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Snapshot directory (None = in-memory only)
    pub data_dir: Option<PathBuf>,
    /// Quiet period that coalesces bursts of updates into one write
    pub debounce_ms: u64,
    /// First retry delay; doubles on every further attempt
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Attempts per flush before giving up until the next trigger
    pub max_attempts: u32,
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.retry_base_ms
                .saturating_mul(factor)
                .min(self.retry_max_ms),
        )
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            debounce_ms: 2_000,
            retry_base_ms: 200,
            retry_max_ms: 10_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Frames buffered per connection before it is considered too slow
    pub outbox_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Secret the session token key is derived from
    pub token_secret: String,
}

/// A workspace: its members and the documents bound to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub id: String,
    #[serde(default)]
    pub documents: Vec<DocumentId>,
    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    pub user: UserId,
    pub role: Role,
}
