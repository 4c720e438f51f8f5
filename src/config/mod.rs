//! Configuration for the entity monitoring engine.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
//! - Component-wise validation
mod retry;
mod store;
mod watch;
pub use retry::*;
pub use store::*;
pub use watch::*;
use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Environment variable prefix, e.g. `MONITOR__WATCH__DEDUP=raw_payload`
pub const ENV_PREFIX: &str = "MONITOR";

/// Main configuration container for every monitor sharing one store session
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct MonitorConfig {
    /// Coordination store layout
    #[serde(default)]
    pub store: StoreConfig,
    /// Event delivery behaviour
    #[serde(default)]
    pub watch: WatchConfig,
    /// Retry policies for store calls and unreadable entities
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl Debug for MonitorConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("store", &self.store)
            .field("watch", &self.watch)
            .finish_non_exhaustive()
    }
}

impl MonitorConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `MONITOR__` prefix (highest priority)
    ///
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("MONITOR__STORE__ROOT_PATH", "/midonet/v2");
    /// let cfg = MonitorConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates configuration and returns validated instance.
    pub fn validate(self) -> Result<Self> {
        self.store.validate()?;
        self.watch.validate()?;
        self.retry.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
