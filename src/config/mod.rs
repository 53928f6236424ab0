//! Configuration management for pipeline components
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use catalogue_pipeline::config::Config;
//!
//! # fn main() -> Result<(), catalogue_pipeline::config::ConfigError> {
//! let config = Config::load()?;
//! println!("Subscribing as: {}", config.runner.subscription_name);
//! # Ok(())
//! # }
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `PIPELINE__<section>__<key>`
//!
//! Examples:
//! - `PIPELINE__RUNNER__SUBSCRIPTION_NAME=annotations-ingester`
//! - `PIPELINE__RUNNER__THREADS=8`
//! - `PIPELINE__STORAGE__OUTPUT_PREFIX=transformed/`
//!
//! `AWS_ACCESS_KEY` (or `AWS_ACCESS_KEY_ID`) and `AWS_SECRET_ACCESS_KEY`
//! are also honoured.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/pipeline.toml`.
//! This can be overridden using the `PIPELINE_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::HumanDuration;
pub use models::{
    Config, RunnerConfig, StorageConfig, StorageProvider, TelemetryConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`PIPELINE__*`)
    /// 2. TOML file (default: `config/pipeline.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load without validating, so command line overrides can be applied first
    pub fn load_unvalidated(path: Option<std::path::PathBuf>) -> Result<Self, ConfigError> {
        Ok(sources::load_with_path(path)?)
    }

    /// Re-run validation, e.g. after command line overrides were applied
    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate(self)?;
        Ok(())
    }
}
