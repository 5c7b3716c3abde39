//! Configuration management for vmflow
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use vmflow::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Running {} jobs at a time", config.manager.max_concurrent_jobs);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `VMFLOW__<section>__<key>`
//!
//! Examples:
//! - `VMFLOW__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `VMFLOW__MANAGER__MAX_CONCURRENT_JOBS=8`
//! - `VMFLOW__WEBHOOKS__BLOCK_PRIVATE_IPS=false`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/vmflow.toml`.
//! This can be overridden using the `VMFLOW_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use models::{
    BatchConfig, Config, ExecutorConfig, HubConfig, ManagerConfig, MissedRunPolicy,
    SchedulerConfig, ServerConfig, WebhookConfig, WebhookEndpoint,
};
pub use sources::default_path;
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
    /// 1. Environment variables (`VMFLOW__*`)
    /// 2. TOML file (default: `config/vmflow.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file is malformed
    /// - Validation fails (zero capacities, bad webhook endpoints)
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[executor]
program = "/usr/local/bin/vm-export"
args = ["--quiet"]
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(
            config.executor.program.as_deref(),
            Some("/usr/local/bin/vm-export")
        );
        assert_eq!(config.executor.args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn test_validation_runs_after_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[batch]
max_concurrency = 0
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::ZeroValue { .. })
        ));
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(&config_path, "[manager\nmax_concurrent_jobs = ").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(result.unwrap_err(), ConfigError::LoadError(_)));
    }
}
