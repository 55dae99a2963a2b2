//! Normalized data model shared across container engines
//!
//! Records are immutable value snapshots taken at query time, not live
//! handles; staleness between polls is expected. Fields an engine does not
//! report become zero-values, never nulls that crash downstream consumers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The container engine that owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Docker,
    Podman,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine selection for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineSelector {
    #[default]
    All,
    Docker,
    Podman,
}

impl EngineSelector {
    /// Whether a backend of the given engine is covered by this selector.
    pub fn selects(&self, engine: Engine) -> bool {
        match self {
            EngineSelector::All => true,
            EngineSelector::Docker => engine == Engine::Docker,
            EngineSelector::Podman => engine == Engine::Podman,
        }
    }
}

/// A container port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Point-in-time resource usage snapshot for a running container.
///
/// Derived from two consecutive raw counter reads; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

/// Engine-agnostic container snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Human status string as reported by the engine ("Up 2 hours").
    pub status: String,
    /// Normalized lifecycle state ("running", "exited", ...).
    pub state: String,
    pub engine: Engine,
    pub created: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ContainerStats>,
}

/// Pod snapshot. Only Podman reports pods; the Docker backend always yields
/// an empty collection, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub containers: Vec<String>,
    pub engine: Engine,
}

/// Filtering criteria for list queries.
///
/// Usage and privileged lookups cost one extra engine round trip per
/// container and are opt-in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub engine: EngineSelector,
    #[serde(default)]
    pub include_stats: bool,
    #[serde(default)]
    pub include_privileged: bool,
}

/// Request to create and start a container from an existing image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub name: String,
    pub image: String,
    /// Port mappings in `host:container[/protocol]` form.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Volume mappings in `source:destination` form; a source that does not
    /// start with `/` or `.` names a volume.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Environment variables in `KEY=VALUE` form.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

/// Configuration for the scheduled container update job.
///
/// Replaced wholesale on every reconfiguration; there are no partial field
/// updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJobConfig {
    /// Cron expression, five or six fields ("0 2 * * *").
    pub schedule: String,
    pub enabled: bool,
    /// Container name patterns matched by literal substring containment.
    /// Empty list matches every container.
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for UpdateJobConfig {
    fn default() -> Self {
        Self {
            schedule: "0 2 * * *".to_string(),
            enabled: false,
            filters: Vec::new(),
        }
    }
}
