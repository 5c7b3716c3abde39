use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "VMFLOW_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/vmflow.toml";
const ENV_PREFIX: &str = "VMFLOW";
const ENV_SEPARATOR: &str = "__";

/// Resolve the config file path: `VMFLOW_CONFIG` or the default location
pub fn default_path() -> PathBuf {
    env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    // Load .env file if it exists (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    load_from_sources(default_path())
}

/// Load configuration from a specific path and environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // VMFLOW__MANAGER__MAX_CONCURRENT_JOBS -> manager.max_concurrent_jobs
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MissedRunPolicy;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.manager.max_concurrent_jobs, 4);
        assert_eq!(config.hub.mailbox_capacity, 256);
        assert!(config.webhooks.block_private_ips);
        assert_eq!(config.scheduler.missed_runs, MissedRunPolicy::FireOnce);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[server]
bind_addr = "127.0.0.1:9000"

[manager]
max_concurrent_jobs = 2

[scheduler]
tick_interval_ms = 250
missed_runs = "skip"

[hub]
disconnect_after_drops = 10

[[webhooks.endpoints]]
url = "https://hooks.example.com/vm"
events = ["job.completed", "job.failed"]

[webhooks.endpoints.headers]
x-api-key = "secret"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.manager.max_concurrent_jobs, 2);
        assert_eq!(config.manager.shutdown_timeout_secs, 30);
        assert_eq!(config.scheduler.tick_interval_ms, 250);
        assert_eq!(config.scheduler.missed_runs, MissedRunPolicy::Skip);
        assert_eq!(config.hub.disconnect_after_drops, Some(10));

        let endpoint = &config.webhooks.endpoints[0];
        assert_eq!(endpoint.events.len(), 2);
        assert!(endpoint.enabled);
        assert_eq!(endpoint.headers["x-api-key"], "secret");
    }

    #[test]
    fn test_endpoint_defaults_to_all_events() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(
            &config_path,
            r#"
[[webhooks.endpoints]]
url = "https://hooks.example.com/all"
            "#,
        )
        .unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.webhooks.endpoints[0].events, vec!["*".to_string()]);
    }
}
