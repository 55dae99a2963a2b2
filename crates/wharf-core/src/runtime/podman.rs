//! Podman runtime backend
//!
//! Containers go through Podman's Docker-compatible API socket; pods and
//! usage statistics have no Docker-compatible surface and go through the
//! `podman` CLI with JSON output. Unlike Docker, labels on an existing
//! container can be changed here by recreating it in place.

use super::{
    async_trait, binary_on_path, dockerfile_context, normalize_name, plan_run, restart_policy,
    run_command, stage_compose_file, ContainerRuntime, LogStream,
};
use crate::error::{Error, Result};
use crate::models::{
    ContainerRecord, ContainerStats, Engine, FilterOptions, PodRecord, PortMapping, RunRequest,
};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::HostConfig;
use bollard::volume::CreateVolumeOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const STOP_TIMEOUT_SECS: i64 = 10;

/// Default rootful API socket; also the retry target when the binary is
/// present but no candidate answered.
const PRIMARY_SOCKET: &str = "/run/podman/podman.sock";

/// Podman-backed implementation of [`ContainerRuntime`].
pub struct PodmanRuntime {
    client: Docker,
}

impl PodmanRuntime {
    /// Connect to the Podman API service, probing well-known socket
    /// locations in order until one answers a ping.
    ///
    /// All candidate failures are reported together so an operator can see
    /// which paths were tried. When the `podman` binary is present but no
    /// socket answers, the API service is likely just not running.
    pub async fn connect(socket: Option<&str>) -> Result<Self> {
        let candidates = candidate_sockets(socket);
        let mut failures = Vec::with_capacity(candidates.len());

        for candidate in &candidates {
            let path = candidate.to_string_lossy();
            match try_socket(&path).await {
                Ok(client) => {
                    debug!(socket = %path, "Connected to Podman API socket");
                    return Ok(Self { client });
                }
                Err(error) => failures.push(format!("{path}: {error}")),
            }
        }

        if binary_on_path("podman") {
            warn!(
                "podman binary found but no API socket answered; \
                 enable it with `systemctl --user start podman.socket` or \
                 `podman system service`"
            );
            // The service may have come up while we probed the fallbacks;
            // the retry always targets the primary default, not whatever
            // candidate happened to be first.
            if let Ok(client) = try_socket(PRIMARY_SOCKET).await {
                return Ok(Self { client });
            }
        }

        Err(Error::Connection {
            engine: Engine::Podman,
            detail: failures.join("; "),
        })
    }

    /// Usage snapshots for all running containers, keyed by id and name.
    async fn stats_by_container(&self) -> Result<HashMap<String, ContainerStats>> {
        let output = run_command("podman", &["stats", "--no-stream", "--format", "json"]).await?;
        let entries: Vec<CliStatsEntry> = serde_json::from_str(output.trim())
            .map_err(|error| Error::InvalidInput(format!("unparseable podman stats output: {error}")))?;

        let mut by_container = HashMap::with_capacity(entries.len() * 2);
        for entry in entries {
            let stats = entry.to_stats();
            if !entry.id.is_empty() {
                by_container.insert(entry.id.clone(), stats.clone());
                // Engine listings use the long id; stats may report the
                // short form.
                if entry.id.len() >= 12 {
                    by_container.insert(entry.id[..12].to_string(), stats.clone());
                }
            }
            if !entry.name.is_empty() {
                by_container.insert(entry.name.clone(), stats);
            }
        }
        Ok(by_container)
    }

    async fn container_privileged(&self, id: &str) -> Option<bool> {
        match self.client.inspect_container(id, None).await {
            Ok(inspect) => inspect.host_config.and_then(|host| host.privileged),
            Err(error) => {
                debug!(container_id = id, error = %error, "Failed to inspect container for privileged flag");
                None
            }
        }
    }

    /// Replace a container in place with a new label map, preserving its
    /// name, configuration, and run state.
    async fn recreate_with_labels(&self, id: &str, labels: HashMap<String, String>) -> Result<()> {
        let inspect = self.client.inspect_container(id, None).await?;
        let name = normalize_name(&inspect.name.clone().unwrap_or_default());
        let was_running = inspect
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        let host_config = inspect.host_config.clone();
        let mut config = Config::from(inspect.config.unwrap_or_default());
        config.labels = Some(labels);
        config.host_config = host_config;

        if was_running {
            self.client
                .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
                .await?;
        }
        self.delete_container(id, true).await?;

        let options = CreateContainerOptions {
            name,
            platform: None,
        };
        let created = self.client.create_container(Some(options), config).await?;
        if was_running {
            self.client
                .start_container(&created.id, None::<StartContainerOptions<String>>)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn engine(&self) -> Engine {
        Engine::Podman
    }

    async fn list_containers(&self, filter: &FilterOptions) -> Result<Vec<ContainerRecord>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(name) = &filter.name {
            filters.insert("name".to_string(), vec![name.clone()]);
        }
        if let Some(status) = &filter.status {
            filters.insert("status".to_string(), vec![status.clone()]);
        }

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await?;

        let stats_by_container = if filter.include_stats {
            match self.stats_by_container().await {
                Ok(stats) => stats,
                Err(error) => {
                    debug!(error = %error, "Failed to collect container stats");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let mut records = Vec::with_capacity(containers.len());
        for container in containers {
            let id = container.id.unwrap_or_default();
            let name = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| normalize_name(name))
                .unwrap_or_default();

            let stats = stats_by_container
                .get(&id)
                .or_else(|| stats_by_container.get(&name))
                .cloned();

            let mut record = ContainerRecord {
                id,
                name,
                image: container.image.unwrap_or_default(),
                status: container.status.unwrap_or_default(),
                state: container.state.unwrap_or_default(),
                engine: Engine::Podman,
                created: container
                    .created
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now),
                labels: container.labels.unwrap_or_default(),
                ports: container
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|port| PortMapping {
                        container_port: u16::try_from(port.private_port).unwrap_or(0),
                        host_port: port
                            .public_port
                            .and_then(|public| u16::try_from(public).ok())
                            .unwrap_or(0),
                        protocol: port
                            .typ
                            .map(|typ| typ.to_string())
                            .unwrap_or_else(|| "tcp".to_string()),
                    })
                    .collect(),
                privileged: None,
                stats,
            };

            if filter.include_privileged {
                record.privileged = self.container_privileged(&record.id).await;
            }
            records.push(record);
        }

        Ok(records)
    }

    async fn list_pods(&self, filter: &FilterOptions) -> Result<Vec<PodRecord>> {
        let output = run_command("podman", &["pod", "ps", "--format", "json"]).await?;
        let entries: Vec<CliPodEntry> = serde_json::from_str(output.trim())
            .map_err(|error| Error::InvalidInput(format!("unparseable podman pod output: {error}")))?;

        let pods = entries
            .into_iter()
            .map(CliPodEntry::into_record)
            .filter(|pod| {
                filter
                    .name
                    .as_ref()
                    .map_or(true, |name| pod.name.contains(name.as_str()))
            })
            .filter(|pod| {
                filter
                    .status
                    .as_ref()
                    .map_or(true, |status| pod.status.eq_ignore_ascii_case(status))
            })
            .collect();
        Ok(pods)
    }

    async fn delete_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.client.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions { t: STOP_TIMEOUT_SECS };
        self.client.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        let options = RestartContainerOptions {
            t: STOP_TIMEOUT_SECS as isize,
        };
        self.client.restart_container(id, Some(options)).await?;
        Ok(())
    }

    async fn delete_pod(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["pod", "rm"];
        if force {
            args.push("-f");
        }
        args.push(id);
        run_command("podman", &args).await.map(|_| ())
    }

    async fn start_pod(&self, id: &str) -> Result<()> {
        run_command("podman", &["pod", "start", id]).await.map(|_| ())
    }

    async fn stop_pod(&self, id: &str) -> Result<()> {
        run_command("podman", &["pod", "stop", id]).await.map(|_| ())
    }

    async fn restart_pod(&self, id: &str) -> Result<()> {
        run_command("podman", &["pod", "restart", id]).await.map(|_| ())
    }

    async fn build_image(&self, dockerfile: &str, image_name: &str) -> Result<()> {
        let context = dockerfile_context(dockerfile)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image_name.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(context.into()));
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn run_container(&self, request: &RunRequest) -> Result<String> {
        let plan = plan_run(request)?;
        for volume in &plan.named_volumes {
            let options = CreateVolumeOptions {
                name: volume.clone(),
                ..Default::default()
            };
            if let Err(error) = self.client.create_volume(options).await {
                warn!(volume = %volume, error = %error, "Failed to create named volume");
            }
        }

        let config = Config::<String> {
            image: Some(request.image.clone()),
            env: (!request.env.is_empty()).then(|| request.env.clone()),
            exposed_ports: (!plan.exposed_ports.is_empty()).then_some(plan.exposed_ports),
            host_config: Some(HostConfig {
                binds: (!plan.binds.is_empty()).then_some(plan.binds),
                port_bindings: (!plan.port_bindings.is_empty()).then_some(plan.port_bindings),
                restart_policy: restart_policy(request.restart_policy.as_deref()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };
        let created = self.client.create_container(Some(options), config).await?;

        if let Err(error) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Do not leave a created-but-never-started container behind.
            if let Err(cleanup) = self.delete_container(&created.id, true).await {
                warn!(container_id = %created.id, error = %cleanup, "Failed to clean up container after start failure");
            }
            return Err(error.into());
        }
        Ok(created.id)
    }

    async fn deploy_compose(
        &self,
        compose: &str,
        project_name: &str,
        deploy_dir: Option<&Path>,
    ) -> Result<()> {
        if !binary_on_path("podman-compose") {
            return Err(Error::Unsupported(
                "podman-compose not found in PATH".into(),
            ));
        }

        let project = if project_name.is_empty() {
            derive_project_name(compose)?
        } else {
            project_name.to_string()
        };

        let (compose_path, _scratch) = stage_compose_file(compose, deploy_dir).await?;
        let path = compose_path.to_string_lossy().into_owned();

        run_command(
            "podman-compose",
            &["-f", path.as_str(), "-p", project.as_str(), "up", "-d"],
        )
        .await
        .map(|_| ())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn update_container(&self, id: &str) -> Result<()> {
        let inspect = self.client.inspect_container(id, None).await?;
        let image = inspect
            .config
            .as_ref()
            .and_then(|config| config.image.clone())
            .ok_or_else(|| Error::NotFound(format!("container {id} has no image reference")))?;
        let name = normalize_name(&inspect.name.clone().unwrap_or_default());

        self.pull_image(&image).await?;
        self.client
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await?;
        self.delete_container(id, true).await?;

        let mut config = Config::from(inspect.config.unwrap_or_default());
        config.image = Some(image);
        config.host_config = inspect.host_config;

        let options = CreateContainerOptions {
            name,
            platform: None,
        };
        let created = self.client.create_container(Some(options), config).await?;
        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stream_logs(&self, id: &str, follow: bool, tail: Option<u64>) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.map(|n| n.to_string()).unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let stream = self
            .client
            .logs(id, Some(options))
            .map(|item| item.map(LogOutput::into_bytes).map_err(Error::from))
            .boxed();
        Ok(stream)
    }

    async fn set_labels(&self, id: &str, labels: &HashMap<String, String>) -> Result<()> {
        let inspect = self.client.inspect_container(id, None).await?;
        let mut merged = inspect
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default();
        merged.extend(labels.iter().map(|(key, value)| (key.clone(), value.clone())));
        self.recreate_with_labels(id, merged).await
    }

    async fn remove_labels(&self, id: &str, keys: &[String]) -> Result<()> {
        let inspect = self.client.inspect_container(id, None).await?;
        let mut pruned = inspect
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default();
        for key in keys {
            pruned.remove(key);
        }
        self.recreate_with_labels(id, pruned).await
    }
}

/// Socket locations to probe, most specific first. The `/var/run` form is
/// how rootful sockets commonly appear when mounted into a container.
fn candidate_sockets(custom: Option<&str>) -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(4);
    if let Some(path) = custom {
        candidates.push(PathBuf::from(path));
    }
    candidates.push(PathBuf::from(PRIMARY_SOCKET));
    candidates.push(PathBuf::from("/var/run/podman/podman.sock"));
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        candidates.push(Path::new(&runtime_dir).join("podman/podman.sock"));
    }
    candidates.dedup();
    candidates
}

async fn try_socket(path: &str) -> Result<Docker> {
    if !Path::new(path).exists() {
        return Err(Error::Connection {
            engine: Engine::Podman,
            detail: "socket does not exist".to_string(),
        });
    }

    let client = Docker::connect_with_socket(path, 120, API_DEFAULT_VERSION)?;
    match tokio::time::timeout(Duration::from_secs(5), client.ping()).await {
        Ok(Ok(_)) => Ok(client),
        Ok(Err(error)) => Err(error.into()),
        Err(_) => Err(Error::Timeout),
    }
}

/// Project name for a compose deployment without an explicit one: the first
/// service name in sorted order, so repeated deployments of the same file
/// land in the same project.
fn derive_project_name(compose: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct ComposeFile {
        services: HashMap<String, serde_yaml::Value>,
    }

    let parsed: ComposeFile = serde_yaml::from_str(compose)
        .map_err(|error| Error::InvalidInput(format!("unparseable compose file: {error}")))?;
    let mut names: Vec<String> = parsed.services.into_keys().collect();
    names.sort();
    names
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidInput("compose file declares no services".into()))
}

/// One row of `podman stats --no-stream --format json`. Field names moved
/// between releases; aliases cover both spellings.
#[derive(Debug, Deserialize)]
struct CliStatsEntry {
    #[serde(rename = "ContainerID", alias = "ID", default)]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CPU", alias = "CPUPerc", default)]
    cpu: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "Mem", alias = "MemPerc", default)]
    mem: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
    #[serde(rename = "BlockIO", default)]
    block_io: String,
    #[serde(rename = "PIDS", alias = "PIDs", default)]
    pids: String,
}

impl CliStatsEntry {
    fn to_stats(&self) -> ContainerStats {
        let (memory_usage, memory_limit) = parse_size_pair(&self.mem_usage);
        let (network_rx, network_tx) = parse_size_pair(&self.net_io);
        let (block_read, block_write) = parse_size_pair(&self.block_io);

        ContainerStats {
            cpu_percent: parse_percent(&self.cpu),
            memory_usage,
            memory_limit,
            memory_percent: parse_percent(&self.mem),
            network_rx,
            network_tx,
            block_read,
            block_write,
            pids: self.pids.trim().parse().unwrap_or(0),
        }
    }
}

/// One row of `podman pod ps --format json`.
#[derive(Debug, Deserialize)]
struct CliPodEntry {
    #[serde(rename = "Id", alias = "ID", default)]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Created", default)]
    created: String,
    #[serde(rename = "Containers", default)]
    containers: Vec<CliPodContainer>,
}

#[derive(Debug, Deserialize)]
struct CliPodContainer {
    #[serde(rename = "Names", default)]
    names: String,
}

impl CliPodEntry {
    fn into_record(self) -> PodRecord {
        PodRecord {
            id: self.id,
            name: self.name,
            status: self.status,
            created: DateTime::parse_from_rfc3339(&self.created)
                .map(|created| created.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            containers: self
                .containers
                .into_iter()
                .map(|container| container.names)
                .filter(|names| !names.is_empty())
                .collect(),
            engine: Engine::Podman,
        }
    }
}

fn parse_percent(value: &str) -> f64 {
    value
        .trim()
        .trim_end_matches('%')
        .parse()
        .unwrap_or(0.0)
}

/// Split a `used / total` CLI field into two byte counts.
fn parse_size_pair(value: &str) -> (u64, u64) {
    let mut parts = value.splitn(2, '/');
    let first = parts.next().map(parse_size).unwrap_or(0);
    let second = parts.next().map(parse_size).unwrap_or(0);
    (first, second)
}

/// Parse a human-readable size like `4.63MB` or `1.2GiB` into bytes.
/// Decimal suffixes use powers of 1000, binary suffixes powers of 1024;
/// anything unparseable (including the CLI's `--` placeholder) is zero.
fn parse_size(value: &str) -> u64 {
    let value = value.trim();
    if value.is_empty() || value == "--" {
        return 0;
    }

    let split = value
        .find(|ch: char| ch.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let Ok(number) = number.trim().parse::<f64>() else {
        return 0;
    };

    let multiplier: f64 = match unit.trim() {
        "" | "B" | "b" => 1.0,
        "kB" | "KB" => 1000.0,
        "MB" => 1000.0 * 1000.0,
        "GB" => 1000.0 * 1000.0 * 1000.0,
        "TB" => 1000.0f64.powi(4),
        "KiB" | "kiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0f64.powi(4),
        _ => return 0,
    };

    (number * multiplier) as u64
}
