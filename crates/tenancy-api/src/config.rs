//! Server configuration
//!
//! `config/tenancy.toml` (or the file named by `TENANCY_CONFIG`) overlaid
//! with `TENANCY__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tenancy_core::{config, ConfigError, TenancyConfig};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "TENANCY";
/// Names the configuration file
pub const CONFIG_PATH_VAR: &str = "TENANCY_CONFIG";
/// Used when `TENANCY_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/tenancy.toml";

/// Full application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP server and storage
    pub server: ServerConfig,
    /// Core services
    pub tenancy: TenancyConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: String,
    /// SQLite URL; everything stays in memory when unset
    pub database_url: Option<String>,
    /// SQLite pool size
    pub max_connections: u32,
    /// Per-request deadline
    pub request_timeout_ms: u64,
    /// Background rollover sweep interval; 0 disables the sweeper
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
            database_url: None,
            max_connections: 5,
            request_timeout_ms: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load from the configured file and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(Some(&path))
    }

    /// Load from an explicit file (missing is fine) and the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = config::load(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tenancy.validate()?;
        self.bind_addr()?;
        if self.server.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parsed listen address
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server.bind_addr.parse().map_err(|e| {
            ConfigError::Invalid(format!("server.bind_addr {}: {e}", self.server.bind_addr))
        })
    }
}
