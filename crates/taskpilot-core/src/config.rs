//! TaskPilot configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskPilotError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPilotConfig {
    #[serde(default)]
    pub hubspot: HubSpotConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for TaskPilotConfig {
    fn default() -> Self {
        Self {
            hubspot: HubSpotConfig::default(),
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl TaskPilotConfig {
    /// Load config from the default path (~/.taskpilot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskPilotError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskPilotError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskPilotError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskPilot home directory (~/.taskpilot).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskpilot")
    }
}

/// HubSpot API access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSpotConfig {
    /// Private-app access token. Falls back to HUBSPOT_TOKEN env var if empty.
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "default_api_base")]
    pub base_url: String,
}

fn default_api_base() -> String {
    "https://api.hubapi.com".into()
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            base_url: default_api_base(),
        }
    }
}

impl HubSpotConfig {
    /// Resolve the effective access token (config value or env var).
    pub fn resolve_token(&self) -> String {
        if !self.access_token.is_empty() {
            return self.access_token.clone();
        }
        std::env::var("HUBSPOT_TOKEN").unwrap_or_default()
    }
}

/// Local cache database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.taskpilot/cache.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret for webhook HMAC validation. Empty = validation disabled.
    #[serde(default)]
    pub webhook_secret: String,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8420
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_secret: String::new(),
        }
    }
}

/// Sync and reconciliation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Wall-clock budget for a full resync; a running execution older than
    /// this is considered dead and marked failed.
    #[serde(default = "default_sync_timeout")]
    pub timeout_secs: u64,
    /// Lower bound of the stuck-run window: runs older than this are no
    /// longer retried.
    #[serde(default = "default_retry_window")]
    pub retry_window_hours: i64,
    /// Grace period before a missed run becomes eligible for retry, so the
    /// reconciler never races the primary executor.
    #[serde(default = "default_grace")]
    pub retry_grace_minutes: i64,
    /// Maximum runs retried per reconciler sweep.
    #[serde(default = "default_batch_limit")]
    pub retry_batch_limit: usize,
}

fn default_sync_timeout() -> u64 {
    600
}
fn default_retry_window() -> i64 {
    48
}
fn default_grace() -> i64 {
    10
}
fn default_batch_limit() -> usize {
    100
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sync_timeout(),
            retry_window_hours: default_retry_window(),
            retry_grace_minutes: default_grace(),
            retry_batch_limit: default_batch_limit(),
        }
    }
}
