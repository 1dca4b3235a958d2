use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Engine-wide settings. Every field has a default so partial files load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Run lifecycle commands inside a per-worktree container instead of on the host.
    pub container_isolation: bool,
    /// Container runtime CLI (`docker`, `podman`).
    pub container_runtime: String,
    /// Needs `sh` plus curl, wget or bash for container-routed health probes.
    pub container_image: String,
    /// Command that keeps an idle container alive.
    pub container_keepalive_command: String,
    pub container_name_prefix: String,
    pub ssh_base_port: u16,
    pub app_base_port: u16,
    pub container_stop_grace_secs: u64,
    /// Wall-clock limit for stop and nuke commands.
    pub command_timeout_secs: u64,
    pub logs_timeout_secs: u64,
    pub logs_max_bytes: usize,
    pub probe_timeout_secs: u64,
    /// How long start watches the start command for an early exit.
    pub start_grace_millis: u64,
    pub restart_delay_millis: u64,
    pub health_tick_interval_secs: u64,
    /// Extra variable names removed from the environment handed to commands.
    pub scrub_env_vars: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_isolation: false,
            container_runtime: "docker".to_string(),
            container_image: "ubuntu:24.04".to_string(),
            container_keepalive_command: "sleep infinity".to_string(),
            container_name_prefix: "wtenv-".to_string(),
            ssh_base_port: 42000,
            app_base_port: 43000,
            container_stop_grace_secs: 10,
            command_timeout_secs: 300,
            logs_timeout_secs: 15,
            logs_max_bytes: 256 * 1024,
            probe_timeout_secs: 5,
            start_grace_millis: 1500,
            restart_delay_millis: 2000,
            health_tick_interval_secs: 10,
            scrub_env_vars: Vec::new(),
        }
    }
}

impl Config {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn logs_timeout(&self) -> Duration {
        Duration::from_secs(self.logs_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_millis)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_millis)
    }

    pub fn container_stop_grace(&self) -> Duration {
        Duration::from_secs(self.container_stop_grace_secs)
    }

    pub fn health_tick_interval(&self) -> Duration {
        Duration::from_secs(self.health_tick_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "command_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.logs_timeout_secs == 0 || self.probe_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "logs_timeout_secs and probe_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.logs_max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "logs_max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.health_tick_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "health_tick_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.container_runtime.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "container_runtime must not be empty".to_string(),
            ));
        }
        if self.container_isolation && self.container_image.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "container_image is required when container_isolation is enabled".to_string(),
            ));
        }
        if shlex::split(&self.container_keepalive_command).is_none_or(|argv| argv.is_empty()) {
            return Err(ConfigError::ValidationError(
                "container_keepalive_command must be a non-empty shell word list".to_string(),
            ));
        }
        if self.ssh_base_port == self.app_base_port {
            return Err(ConfigError::ValidationError(
                "ssh_base_port and app_base_port must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `WTENV_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("WTENV_CONTAINER_ISOLATION") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.container_isolation = true,
                "0" | "false" | "no" | "off" => self.container_isolation = false,
                other => {
                    tracing::warn!("Ignoring invalid WTENV_CONTAINER_ISOLATION value '{other}'")
                }
            }
        }
        if let Some(runtime) = lookup("WTENV_CONTAINER_RUNTIME").filter(|v| !v.trim().is_empty()) {
            self.container_runtime = runtime;
        }
        if let Some(image) = lookup("WTENV_CONTAINER_IMAGE").filter(|v| !v.trim().is_empty()) {
            self.container_image = image;
        }
    }
}

/// Will always return config, falling back to defaults for a missing or unreadable file.
pub async fn load_config_from_file(config_path: &Path) -> Config {
    match tokio::fs::read_to_string(config_path).await {
        Ok(raw_config) => match serde_json::from_str::<Config>(&raw_config) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config at {}: {}; using defaults",
                    config_path.display(),
                    e
                );
                Config::default()
            }
        },
        Err(_) => {
            tracing::info!("No config file found at {}, using defaults", config_path.display());
            Config::default()
        }
    }
}

/// Saves the config to the given path
pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    let raw_config = serde_json::to_string_pretty(config)?;
    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(config_path, raw_config).await?;
    Ok(())
}
