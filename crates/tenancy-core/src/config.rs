//! Tenancy configuration
//!
//! Typed settings with defaults, layered from an optional TOML file and
//! `PREFIX__SECTION__KEY` environment variables.

use crate::catalog::CatalogSeed;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Core service settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    pub metering: MeteringConfig,
    pub lifecycle: LifecycleConfig,
    /// Catalog bootstrap; the standard seed is used when absent
    pub catalog: Option<CatalogSeed>,
}

impl TenancyConfig {
    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metering.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "metering.operation_timeout_ms must be positive".into(),
            ));
        }
        if self.lifecycle.sweep_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.sweep_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Usage metering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Deadline for one check-and-increment
    pub operation_timeout_ms: u64,
    /// Extra attempts on row lock contention
    pub conflict_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5_000,
            conflict_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

impl MeteringConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Subscription lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Extra attempts for a due rollover before surfacing the error
    pub rollover_retries: u32,
    pub retry_backoff_ms: u64,
    /// Live subscriptions examined per sweep
    pub sweep_batch_size: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            rollover_retries: 5,
            retry_backoff_ms: 50,
            sweep_batch_size: 500,
        }
    }
}

/// Load `T` from an optional TOML file overlaid with environment variables
///
/// `TENANCY__METERING__CONFLICT_RETRIES=5` sets `metering.conflict_retries`
/// for `env_prefix = "TENANCY"`. A missing file is not an error.
pub fn load<T: DeserializeOwned>(path: Option<&Path>, env_prefix: &str) -> Result<T, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .separator("__")
            .try_parsing(true),
    );

    Ok(builder.build()?.try_deserialize()?)
}
