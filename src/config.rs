use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pairing::PairingSettings;
use crate::scrobble::ScrobbleSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceKeys {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    pub link_ttl_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 20,
            max_attempts: 15,
            link_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrobbleConfig {
    pub min_duration_ms: u64,
    pub min_listen_ratio: f64,
    pub voice_retry_interval_secs: u64,
    pub voice_retry_attempts: u32,
}

impl Default for ScrobbleConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: 20_000,
            min_listen_ratio: 0.75,
            voice_retry_interval_secs: 2,
            voice_retry_attempts: 3,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub keys: Option<ServiceKeys>,
    pub base_url: Option<String>,
    pub store_path: Option<PathBuf>,
    pub pairing: PairingConfig,
    pub scrobble: ScrobbleConfig,
}

impl Config {
    pub fn pairing_settings(&self) -> PairingSettings {
        PairingSettings {
            poll_interval: Duration::from_secs(self.pairing.poll_interval_secs),
            max_attempts: self.pairing.max_attempts,
            link_ttl: Duration::from_secs(self.pairing.link_ttl_secs),
        }
    }

    pub fn scrobble_settings(&self) -> ScrobbleSettings {
        ScrobbleSettings {
            min_duration_ms: self.scrobble.min_duration_ms,
            min_listen_ratio: self.scrobble.min_listen_ratio,
            voice_retry_interval: Duration::from_secs(self.scrobble.voice_retry_interval_secs),
            voice_retry_attempts: self.scrobble.voice_retry_attempts,
        }
    }

    /// User records live next to the config file unless configured otherwise.
    pub fn store_path(&self, config_path: &Path) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            config_path
                .parent()
                .map_or_else(|| PathBuf::from("users.json"), |dir| dir.join("users.json"))
        })
    }
}

pub fn default_config_path() -> PathBuf {
    let fallback = PathBuf::from(".config/fmrelay/config.json");
    dirs::home_dir().map_or(fallback, |home| home.join(".config/fmrelay/config.json"))
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating config directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(config).context("Failed serializing config to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing config at {}", path.display()))?;
    Ok(())
}

pub fn set_service_keys(config: &mut Config, api_key: &str, api_secret: &str) {
    config.keys = Some(ServiceKeys {
        api_key: api_key.to_string(),
        api_secret: api_secret.to_string(),
    });
}
