use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_store_config")]
    pub store: StoreConfig,
    #[serde(default = "default_dispatch_config")]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Upper bound on a single outbound request, connect included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Number of fan-out branches allowed to do network I/O at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,
    /// How long `shutdown` waits for in-flight sends before aborting them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("smsgateway.db")
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_max_in_flight() -> usize {
    16
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_store_config() -> StoreConfig {
    StoreConfig {
        database_path: default_db_path(),
    }
}

pub(crate) fn default_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        request_timeout_secs: default_request_timeout_secs(),
        connect_timeout_secs: default_connect_timeout_secs(),
        max_in_flight: default_max_in_flight(),
        telegram_api_base: default_telegram_api_base(),
        shutdown_grace_secs: default_shutdown_grace_secs(),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: default_store_config(),
            dispatch: default_dispatch_config(),
        }
    }
}

impl Config {
    /// Load the config file, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if config.dispatch.max_in_flight == 0 {
            anyhow::bail!("dispatch.max_in_flight must be at least 1");
        }

        if let Some(parent) = config.store.database_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        Ok(config)
    }
}
