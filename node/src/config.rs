//! Configuration management for the node.

use std::env;

use tether_engine::SyncConfig;

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Channel every device joins
    pub channel: String,
    /// Channel password
    pub password: Option<String>,
    /// User id announced by every device
    pub user: String,
    /// Number of simulated devices
    pub devices: usize,
    /// Message rows seeded into the first device
    pub seed_records: usize,
    /// Stop after this many seconds instead of waiting for Ctrl-C
    pub run_secs: Option<u64>,
    /// Engine settings shared by all devices
    pub engine: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let channel = env::var("TETHER_CHANNEL").unwrap_or_else(|_| "tether-demo".to_string());
        let password = env::var("TETHER_PASSWORD").ok().filter(|p| !p.is_empty());
        let user = env::var("TETHER_USER")
            .unwrap_or_else(|_| format!("user-{}", uuid::Uuid::new_v4().simple()));

        let devices = number("TETHER_DEVICES")?.unwrap_or(2);
        if devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        let seed_records = number("TETHER_SEED_RECORDS")?.unwrap_or(120);
        let run_secs = number("TETHER_RUN_SECS")?.map(|secs| secs as u64);

        // Every device lives in this process, so the per-process guard would
        // tear down all but the last one.
        let engine = SyncConfig::from_env()?.with_reinit_guard(false);

        Ok(Self {
            channel,
            password,
            user,
            devices,
            seed_records,
            run_secs,
            engine,
        })
    }
}

fn number(key: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a non-negative integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("TETHER_DEVICES must be at least 1")]
    NoDevices,

    #[error(transparent)]
    Engine(#[from] tether_engine::ConfigError),
}
