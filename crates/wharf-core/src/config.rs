//! Application configuration
//!
//! The daemon loads this tree once at startup and again on every
//! hot-reload callback; the core re-derives scheduler and proxy state from a
//! fresh `Config` through their `update_config` methods, without restart.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration supplied to the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub docker: EngineConfig,
    #[serde(default)]
    pub podman: EngineConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// "debug" or "release"; controls log verbosity defaults.
    #[serde(default = "default_mode")]
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional socket path override, tried before the well-known defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

/// Reverse-proxy (Caddy) integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory where per-container configuration fragments are stored.
    #[serde(default = "default_fragment_dir")]
    pub fragment_dir: String,
    #[serde(default)]
    pub use_sudo: bool,
    /// Reload the proxy synchronously after every fragment write or delete.
    #[serde(default = "default_true")]
    pub auto_reload: bool,
    #[serde(default = "default_proxy_binary")]
    pub binary_path: String,
    /// "binary" or "systemctl".
    #[serde(default = "default_reload_method")]
    pub reload_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Base directory for persisted compose deployments.
    #[serde(default = "default_deployment_path")]
    pub base_path: String,
}

fn default_port() -> u16 {
    8080
}

fn default_mode() -> String {
    "debug".to_string()
}

fn default_schedule() -> String {
    "0 2 * * *".to_string()
}

fn default_true() -> bool {
    true
}

fn default_fragment_dir() -> String {
    "/etc/caddy/conf.d".to_string()
}

fn default_proxy_binary() -> String {
    "caddy".to_string()
}

fn default_reload_method() -> String {
    "binary".to_string()
}

fn default_deployment_path() -> String {
    "./deployments".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            mode: default_mode(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: default_schedule(),
            filters: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fragment_dir: default_fragment_dir(),
            use_sudo: false,
            auto_reload: true,
            binary_path: default_proxy_binary(),
            reload_method: default_reload_method(),
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            base_path: default_deployment_path(),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus `WHARF_`-prefixed
    /// environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("WHARF").separator("__"));

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
