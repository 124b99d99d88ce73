//! Configuration management for the Arena cluster
//!
//! This module provides a hierarchical configuration system with the
//! following precedence:
//! 1. Environment variables (prefixed with ARENA_)
//! 2. Config file (/etc/arena/config.toml or a path given on the command line)
//! 3. Defaults (lowest priority)
//!
//! The same file is deployed to the master and to every worker; each side
//! reads the sections it needs. Workers read `[master]` to locate the master
//! and to learn the shared secret and heartbeat cadence.
//!
//! # Examples
//!
//! ```no_run
//! use arena_core::config::ConfigLoader;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration with all sources
//! let config = ConfigLoader::new().load()?;
//!
//! // Load from a specific file
//! let config = ConfigLoader::new()
//!     .with_file("/path/to/config.toml")
//!     .load()?;
//! # Ok(())
//! # }
//! ```

pub mod models;

use anyhow::{bail, Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use std::path::{Path, PathBuf};

// Re-export all public types from the models module
pub use models::{
    Config, MasterConfig, PathsConfig, StorageConfig, TimeoutsConfig, WorkerConfig,
};

/// Default configuration file location
const DEFAULT_CONFIG_FILE: &str = "/etc/arena/config.toml";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "ARENA";

/// Environment variable separator for nested configuration
/// Example: ARENA_MASTER__SHARED_SECRET
const ENV_SEPARATOR: &str = "__";

/// Configuration loader with builder pattern
///
/// Provides a flexible way to load configuration from multiple sources
/// with proper precedence handling.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Optional custom configuration file path
    custom_file: Option<PathBuf>,
    /// Whether to skip loading from the default config file
    skip_default_file: bool,
    /// Whether to skip loading from environment variables
    skip_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify a custom configuration file path
    ///
    /// This will be used instead of the default config file location.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip loading from the default configuration file
    pub fn skip_default_file(mut self) -> Self {
        self.skip_default_file = true;
        self
    }

    /// Skip loading from environment variables
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load the configuration from all sources
    ///
    /// # Errors
    ///
    /// Returns an error if file parsing fails, an environment override has
    /// an invalid format, or validation fails (empty shared secret, inverted
    /// port range, heartbeat timeout shorter than the heartbeat interval).
    pub fn load(self) -> Result<Config> {
        let mut builder = ConfigBuilder::builder();

        match &self.custom_file {
            Some(path) => {
                builder = builder.add_source(File::from(path.clone()));
            }
            None if !self.skip_default_file => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false));
            }
            None => {}
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .context("Failed to assemble configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        validate(&config)?;
        Ok(config)
    }
}

/// Validate cross-field constraints the serde layer cannot express.
fn validate(config: &Config) -> Result<()> {
    if config.master.shared_secret.is_empty() {
        bail!("master.shared_secret must be set");
    }
    if config.worker.port_range_start >= config.worker.port_range_end {
        bail!(
            "worker port range is empty: [{}, {})",
            config.worker.port_range_start,
            config.worker.port_range_end
        );
    }
    if config.master.heartbeat_timeout <= config.master.heartbeat_secs {
        bail!(
            "master.heartbeat_timeout ({}s) must exceed master.heartbeat_secs ({}s)",
            config.master.heartbeat_timeout,
            config.master.heartbeat_secs
        );
    }
    if config.worker.available_slots == 0 {
        bail!("worker.available_slots must be at least 1");
    }
    Ok(())
}
