//! Configuration management for the application.
//!
//! Exposes strongly typed structures backed by the `config` crate so the
//! service can load settings from user configuration directories or project
//! overrides alongside environment variables.

use config::{Config, ConfigError, Environment, File};
use dirs::{config_dir, home_dir};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The main application configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port).
    pub server: ServerConfig,
    /// Cloud control-plane configuration.
    pub cloud_api: CloudApiConfig,
    /// Timing knobs for the GPU scheduler.
    #[serde(default)]
    pub timing: TimingConfig,
    /// File path configuration.
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// The host address to bind the server to.
    pub host: String,
    /// The port to listen on.
    pub port: u16,
}

/// Cloud control-plane API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudApiConfig {
    /// Base URL of the workspace API.
    pub base_url: String,
    /// Authorization token sent verbatim on every request.
    pub auth_token: String,
    /// CSRF token, when the deployment requires one.
    #[serde(default)]
    pub csrf_token: Option<String>,
    /// Only workspaces whose name matches this filter are managed.
    pub machine_name_filter: String,
}

/// Timing configuration for GPU management.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// GPU reservation time in minutes.
    #[serde(default = "default_reservation_minutes")]
    pub reservation_minutes: i64,
    /// Shorter reservation used for passthrough claims.
    #[serde(default = "default_fallback_reservation_minutes")]
    pub fallback_reservation_minutes: i64,
    /// Timeout for a paused workspace to come back up.
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Grace period for the inference server after the workspace is running.
    #[serde(default = "default_ollama_readiness_wait_seconds")]
    pub ollama_readiness_wait_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reservation_minutes: default_reservation_minutes(),
            fallback_reservation_minutes: default_fallback_reservation_minutes(),
            startup_timeout_seconds: default_startup_timeout_seconds(),
            ollama_readiness_wait_seconds: default_ollama_readiness_wait_seconds(),
        }
    }
}

fn default_reservation_minutes() -> i64 {
    10
}

fn default_fallback_reservation_minutes() -> i64 {
    3
}

fn default_startup_timeout_seconds() -> u64 {
    120
}

fn default_ollama_readiness_wait_seconds() -> u64 {
    10
}

/// File paths configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Path to the JSON file mapping API keys to users.
    #[serde(default = "default_api_keys_file")]
    pub api_keys_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            api_keys_file: default_api_keys_file(),
        }
    }
}

fn default_api_keys_file() -> PathBuf {
    PathBuf::from("api_keys.json")
}

impl AppConfig {
    /// Loads the application configuration.
    ///
    /// Searches the user's configuration directories first, then project-local
    /// overrides, and finally allows environment variables prefixed with
    /// `APP__` to override nested values.
    pub fn load() -> Result<Self, ConfigError> {
        let _dotenv_path = dotenvy::dotenv();

        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?;

        for path in candidate_config_files() {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}

fn candidate_config_files() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(dir) = config_dir() {
        let path = dir.join("gpu-gateway").join("config.toml");
        if path.exists() {
            paths.push(path);
        }
    }

    if let Some(home) = home_dir() {
        let legacy = home.join(".gpu-gateway").join("config.toml");
        if legacy.exists() {
            paths.push(legacy);
        }
    }

    let project_override = Path::new("gpu-gateway.toml");
    if project_override.exists() {
        paths.push(project_override.to_path_buf());
    }

    let secrets_path = Path::new(".secrets/app.toml");
    if secrets_path.exists() {
        paths.push(secrets_path.to_path_buf());
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_defaults_match_documented_values() {
        let timing = TimingConfig::default();
        assert_eq!(timing.reservation_minutes, 10);
        assert_eq!(timing.fallback_reservation_minutes, 3);
        assert_eq!(timing.startup_timeout_seconds, 120);
        assert_eq!(timing.ollama_readiness_wait_seconds, 10);
    }

    #[test]
    fn paths_default_to_local_key_file() {
        let paths = PathsConfig::default();
        assert_eq!(paths.api_keys_file, PathBuf::from("api_keys.json"));
    }
}
