//! Configuration file
//!
//! A single JSON document with one section per concern. Missing fields fall
//! back to defaults, so a file holding only the `run` section is valid.

use crate::amount::Amount;
use crate::keys::{decode_public_key, validate_phrase};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

pub const DEFAULT_NETWORK_PASSPHRASE: &str = "Pi Network";
const MAX_LOOKAHEAD_SECS: u64 = 10 * 365 * 24 * 3600;

pub const DEFAULT_ENDPOINTS: [&str; 2] = ["http://4.194.35.14:31401", "http://113.161.1.223:31401"];

/// Per-run settings. A run closes over the snapshot active when it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Destination of every forwarded balance.
    pub recipient: String,
    /// Capital source that funds sponsors and receives sweeps.
    pub funding_phrase: String,
    pub sponsor_phrases: Vec<String>,
    /// Maximum number of simultaneously busy sponsors.
    pub concurrent_workers: usize,
    /// Spendable balance (above reserve) a sponsor must hold before a task.
    pub funding_amount: Amount,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            recipient: String::new(),
            funding_phrase: String::new(),
            sponsor_phrases: Vec::new(),
            concurrent_workers: 5,
            funding_amount: Amount::from_stroops(1_000_401),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.recipient.trim().is_empty() {
            return Err("recipient is required".to_string());
        }
        decode_public_key(self.recipient.trim()).map_err(|e| e.to_string())?;
        if self.funding_phrase.trim().is_empty() {
            return Err("funding phrase is required".to_string());
        }
        if !validate_phrase(&self.funding_phrase) {
            return Err("funding phrase is not a valid BIP39 phrase".to_string());
        }
        if self.sponsor_phrases.is_empty() {
            return Err("at least one sponsor phrase is required".to_string());
        }
        if let Some(pos) = self.sponsor_phrases.iter().position(|p| !validate_phrase(p)) {
            return Err(format!("sponsor phrase #{} is not a valid BIP39 phrase", pos + 1));
        }
        if self.concurrent_workers == 0 {
            return Err("concurrent_workers must be at least 1".to_string());
        }
        if !self.funding_amount.is_positive() {
            return Err("funding_amount must be positive".to_string());
        }
        Ok(())
    }

    /// Copy with secret phrases masked, for display.
    pub fn redacted(&self) -> Self {
        let mask = |p: &String| {
            if p.is_empty() {
                String::new()
            } else {
                "********".to_string()
            }
        };
        Self {
            funding_phrase: mask(&self.funding_phrase),
            sponsor_phrases: self.sponsor_phrases.iter().map(mask).collect(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub horizon_endpoints: Vec<String>,
    pub network_passphrase: String,
    /// Reserve per ledger entry; an account must hold `(2 + subentries)` of these.
    pub base_reserve: Amount,
    pub submit_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            horizon_endpoints: DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
            network_passphrase: DEFAULT_NETWORK_PASSPHRASE.to_string(),
            base_reserve: Amount::from_stroops(5_000_000),
            submit_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub maintenance_interval_secs: u64,
    pub lookahead_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3_000,
            maintenance_interval_secs: 60,
            lookahead_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub run: RunConfig,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
    pub alerts: AlertConfig,
    pub server: ServerConfig,
}

/// Engine timing knobs in the form the orchestrator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub tick_interval: Duration,
    pub maintenance_interval: Duration,
    pub lookahead: chrono::Duration,
    pub submit_timeout: Duration,
    pub base_reserve: Amount,
}

impl Default for EngineSettings {
    fn default() -> Self {
        AppConfig::default().engine_settings()
    }
}

impl AppConfig {
    /// Loads the file, or defaults when it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: AppConfig =
            serde_json::from_str(&content).context("Failed to parse config file")?;
        debug!("Config loaded from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;
        let temp_path = path.with_extension("json.tmp");

        fs::write(&temp_path, json)
            .await
            .context("Failed to write temporary config file")?;
        let file = fs::File::open(&temp_path).await?;
        file.sync_all().await.context("Failed to fsync config file")?;
        fs::rename(&temp_path, path)
            .await
            .context("Failed to rename config file")?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            tick_interval: Duration::from_millis(self.engine.tick_interval_ms.max(1)),
            maintenance_interval: Duration::from_secs(self.engine.maintenance_interval_secs.max(1)),
            lookahead: chrono::Duration::seconds(
                i64::try_from(self.engine.lookahead_secs.min(MAX_LOOKAHEAD_SECS)).unwrap_or(0),
            ),
            submit_timeout: Duration::from_secs(self.network.submit_timeout_secs.max(1)),
            base_reserve: self.network.base_reserve,
        }
    }
}
