use configparser::ini::Ini;
use dirs::home_dir;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::api::DEFAULT_PROBE_PATH;
use crate::connection::ConnectionConfig;

pub const DEFAULT_CONFIG_PATH: &str = "~/.fortune-sync.cfg";
pub const DEFAULT_API_URL: &str = "http://localhost:54321/rest/v1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config path: {0}")]
    InvalidPath(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub probe_path: Option<String>,
    pub database_path: Option<String>,
    pub debug: bool,
    /// Seconds between host interface polls in watch mode
    pub interface_poll_interval: Duration,
    pub connection: ConnectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: None,
            probe_path: None,
            database_path: None,
            debug: false,
            interface_poll_interval: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

type Settings = HashMap<String, Option<String>>;

fn parse_setting<T: std::str::FromStr>(settings: &Settings, key: &str) -> Option<T> {
    settings
        .get(key)
        .and_then(|v| v.as_ref())
        .and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load `[settings]` from an INI file. A missing file yields defaults;
    /// unparsable values keep their defaults.
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let config_path = Self::resolve_config_path(config_path)?;

        if !config_path.exists() {
            tracing::debug!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }

        let mut ini = Ini::new();
        ini.set_multiline(true);

        let config_map = ini.load(&config_path).map_err(|e| {
            ConfigError::ParseError(format!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let settings = config_map.get("settings").cloned().unwrap_or_default();
        let defaults = Self::default();

        Ok(Config {
            api_key: settings.get("api_key").and_then(|v| v.clone()),
            api_url: settings.get("api_url").and_then(|v| v.clone()),
            probe_path: settings.get("probe_path").and_then(|v| v.clone()),
            database_path: settings.get("database_path").and_then(|v| v.clone()),
            debug: parse_setting(&settings, "debug").unwrap_or(false),
            interface_poll_interval: parse_setting(&settings, "interface_poll_interval")
                .map(Duration::from_secs)
                .unwrap_or(defaults.interface_poll_interval),
            connection: Self::parse_connection_config(&settings),
        })
    }

    pub fn resolve_config_path(config_path: &str) -> Result<PathBuf, ConfigError> {
        let path = Path::new(config_path);

        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }

        if let Some(rest) = config_path.strip_prefix("~/") {
            if let Some(mut home) = home_dir() {
                home.push(rest);
                return Ok(home);
            }
            return Err(ConfigError::InvalidPath(config_path.to_string()));
        }

        std::env::current_dir()
            .map(|dir| dir.join(config_path))
            .map_err(|_| ConfigError::InvalidPath(config_path.to_string()))
    }

    pub fn get_api_key(&self, cli_key: Option<&String>) -> Option<String> {
        cli_key.cloned().or_else(|| self.api_key.clone())
    }

    pub fn get_api_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn get_probe_path(&self) -> String {
        self.probe_path
            .clone()
            .unwrap_or_else(|| DEFAULT_PROBE_PATH.to_string())
    }

    /// Configured database location with `~/` expanded.
    pub fn get_database_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        self.database_path
            .as_deref()
            .map(Self::resolve_config_path)
            .transpose()
    }

    fn parse_connection_config(settings: &Settings) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();

        if let Some(secs) = parse_setting::<u64>(settings, "probe_interval") {
            if secs > 0 {
                config.probe_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_setting::<u64>(settings, "probe_timeout") {
            if secs > 0 {
                config.probe_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(ms) = parse_setting::<u64>(settings, "backoff_base_ms") {
            config.backoff_base = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_setting::<u64>(settings, "max_backoff") {
            config.max_backoff = Duration::from_secs(secs);
        }

        if let Some(attempts) = parse_setting(settings, "max_reconnect_attempts") {
            config.max_reconnect_attempts = attempts;
        }

        if let Some(threshold) = parse_setting::<u32>(settings, "offline_threshold") {
            config.offline_threshold = threshold.max(1);
        }

        if let Some(attempts) = parse_setting(settings, "max_attempts") {
            config.max_attempts = attempts;
        }

        if let Some(jitter) = parse_setting(settings, "retry_use_jitter") {
            config.use_jitter = jitter;
        }

        config
    }
}
