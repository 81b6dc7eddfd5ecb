//! Server configuration.

use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::change_log::ChangeLogConfig;
use crate::storage::StoreConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}")]
    InvalidValue { var: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listen address
    pub ws_addr: String,
    /// HTTP API listen address
    pub http_addr: String,
    /// Maximum live sessions per document
    pub max_sessions_per_document: usize,
    /// Broadcast capacity per document, for operations and presence
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Projection snapshot every N operations (0 = never)
    pub snapshot_interval: u64,
    /// fsync each append
    pub sync_writes: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: "127.0.0.1:9090".to_string(),
            http_addr: "127.0.0.1:3000".to_string(),
            max_sessions_per_document: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            snapshot_interval: 100,
            sync_writes: true,
        }
    }
}

impl ServerConfig {
    /// Read `GRID_*` variables, falling back to defaults for unset ones.
    ///
    /// Unlike [`Default`], the environment form persists to `GRID_DATA_DIR`
    /// (or `grid_data`) unless `GRID_IN_MEMORY` is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            ws_addr: lookup("GRID_WS_ADDR").unwrap_or(defaults.ws_addr),
            http_addr: lookup("GRID_HTTP_ADDR").unwrap_or(defaults.http_addr),
            max_sessions_per_document: parse(
                &lookup,
                "GRID_MAX_SESSIONS",
                defaults.max_sessions_per_document,
            )?,
            broadcast_capacity: parse(&lookup, "GRID_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            heartbeat_interval_secs: parse(
                &lookup,
                "GRID_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            storage_path: if parse_bool(&lookup, "GRID_IN_MEMORY", false)? {
                None
            } else {
                Some(
                    lookup("GRID_DATA_DIR")
                        .filter(|dir| !dir.is_empty())
                        .map(PathBuf::from)
                        .unwrap_or_else(|| StoreConfig::default().path),
                )
            },
            snapshot_interval: parse(&lookup, "GRID_SNAPSHOT_INTERVAL", defaults.snapshot_interval)?,
            sync_writes: parse_bool(&lookup, "GRID_SYNC_WRITES", defaults.sync_writes)?,
        })
    }

    pub fn change_log_config(&self) -> ChangeLogConfig {
        ChangeLogConfig {
            broadcast_capacity: self.broadcast_capacity,
            snapshot_interval: self.snapshot_interval,
            ..ChangeLogConfig::default()
        }
    }

    /// Store configuration, if persistence is enabled.
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.storage_path.as_ref().map(|path| StoreConfig {
            path: path.clone(),
            sync_writes: self.sync_writes,
            ..StoreConfig::default()
        })
    }
}

fn parse<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { var, value }),
        },
        None => Ok(default),
    }
}
