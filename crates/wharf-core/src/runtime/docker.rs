//! Docker runtime backend
//!
//! Talks to the Docker daemon through its API socket and translates native
//! shapes into the normalized record model. Docker has no pod concept: pod
//! listing yields an empty collection, pod lifecycle and label mutation are
//! explicit unsupported errors.

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
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, Port};
use bollard::volume::CreateVolumeOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Engine-side stop/restart grace period in seconds.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Docker-backed implementation of [`ContainerRuntime`].
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon, preferring an operator-supplied socket
    /// path over the platform default.
    ///
    /// A failed ping is logged but not fatal; the daemon may still come up
    /// after the backend is constructed.
    pub async fn connect(socket: Option<&str>) -> Result<Self> {
        let client = match socket {
            Some(path) => Docker::connect_with_socket(path, 120, API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };

        match tokio::time::timeout(Duration::from_secs(5), client.ping()).await {
            Ok(Ok(_)) => debug!("Docker daemon ping succeeded"),
            Ok(Err(error)) => warn!(error = %error, "Docker client created but ping failed"),
            Err(_) => warn!("Docker daemon ping timed out"),
        }

        Ok(Self { client })
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.client.stats(id, Some(options));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| Error::NotFound(format!("no stats reported for container {id}")))??;
        Ok(snapshot_from_stats(&stats))
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
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn engine(&self) -> Engine {
        Engine::Docker
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

        let mut records = Vec::with_capacity(containers.len());
        for container in containers {
            let id = container.id.unwrap_or_default();
            let name = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| normalize_name(name))
                .unwrap_or_default();

            let mut record = ContainerRecord {
                id,
                name,
                image: container.image.unwrap_or_default(),
                status: container.status.unwrap_or_default(),
                state: container.state.unwrap_or_default(),
                engine: Engine::Docker,
                created: container
                    .created
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now),
                labels: container.labels.unwrap_or_default(),
                ports: map_ports(container.ports.unwrap_or_default()),
                privileged: None,
                stats: None,
            };

            if filter.include_privileged {
                record.privileged = self.container_privileged(&record.id).await;
            }
            if filter.include_stats && record.state == "running" {
                match self.container_stats(&record.id).await {
                    Ok(stats) => record.stats = Some(stats),
                    Err(error) => {
                        debug!(container_id = %record.id, error = %error, "Failed to read container stats")
                    }
                }
            }

            records.push(record);
        }

        Ok(records)
    }

    async fn list_pods(&self, _filter: &FilterOptions) -> Result<Vec<PodRecord>> {
        // Docker has no pods; an empty collection is the correct answer.
        Ok(Vec::new())
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

    async fn delete_pod(&self, _id: &str, _force: bool) -> Result<()> {
        Err(Error::Unsupported("docker does not support pods".into()))
    }

    async fn start_pod(&self, _id: &str) -> Result<()> {
        Err(Error::Unsupported("docker does not support pods".into()))
    }

    async fn stop_pod(&self, _id: &str) -> Result<()> {
        Err(Error::Unsupported("docker does not support pods".into()))
    }

    async fn restart_pod(&self, _id: &str) -> Result<()> {
        Err(Error::Unsupported("docker does not support pods".into()))
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
            // Creation is idempotent enough to attempt every time; container
            // creation fails later if the volume is truly unavailable.
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
        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(created.id)
    }

    async fn deploy_compose(
        &self,
        compose: &str,
        project_name: &str,
        deploy_dir: Option<&Path>,
    ) -> Result<()> {
        if !binary_on_path("docker") {
            return Err(Error::Unsupported("docker CLI not found in PATH".into()));
        }
        let (compose_path, _scratch) = stage_compose_file(compose, deploy_dir).await?;
        let path = compose_path.to_string_lossy().into_owned();

        let mut args = vec!["compose", "-f", path.as_str()];
        if !project_name.is_empty() {
            args.extend(["-p", project_name]);
        }
        args.extend(["up", "-d"]);

        match run_command("docker", &args).await {
            Ok(_) => Ok(()),
            Err(compose_v2_error) => {
                // Fall back to the standalone docker-compose v1 binary.
                if binary_on_path("docker-compose") {
                    let mut args = vec!["-f", path.as_str()];
                    if !project_name.is_empty() {
                        args.extend(["-p", project_name]);
                    }
                    args.extend(["up", "-d"]);
                    run_command("docker-compose", &args).await.map(|_| ())
                } else {
                    Err(compose_v2_error)
                }
            }
        }
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

        // The old container is gone; a failure below leaves it absent. The
        // recreation is best-effort from the inspected configuration.
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

    async fn set_labels(&self, id: &str, _labels: &HashMap<String, String>) -> Result<()> {
        // Confirm the container exists so a bad id is reported as such.
        self.client.inspect_container(id, None).await?;
        Err(Error::Unsupported(
            "docker cannot change labels on an existing container; recreate it with the desired labels".into(),
        ))
    }

    async fn remove_labels(&self, id: &str, _keys: &[String]) -> Result<()> {
        self.client.inspect_container(id, None).await?;
        Err(Error::Unsupported(
            "docker cannot remove labels from an existing container; recreate it without the labels".into(),
        ))
    }
}

/// Translate engine port entries into the shared mapping shape.
fn map_ports(ports: Vec<Port>) -> Vec<PortMapping> {
    ports
        .into_iter()
        .map(|port| PortMapping {
            // The engine reports wider integers; anything out of range is a
            // zero-value rather than a silent truncation.
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
        .collect()
}

/// Delta-over-delta CPU usage percentage.
///
/// Returns exactly 0 unless both the usage delta and the system-time delta
/// are positive.
pub(crate) fn cpu_percent(
    cpu_total: u64,
    precpu_total: u64,
    system: u64,
    presystem: u64,
    online_cpus: u64,
) -> f64 {
    let cpu_delta = cpu_total as f64 - precpu_total as f64;
    let system_delta = system as f64 - presystem as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * online_cpus as f64 * 100.0
    } else {
        0.0
    }
}

fn snapshot_from_stats(stats: &Stats) -> ContainerStats {
    let cpu_percent = cpu_percent(
        stats.cpu_stats.cpu_usage.total_usage,
        stats.precpu_stats.cpu_usage.total_usage,
        stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        stats.cpu_stats.online_cpus.unwrap_or(0),
    );

    let memory_usage = stats.memory_stats.usage.unwrap_or(0);
    let memory_limit = stats.memory_stats.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        memory_usage as f64 / memory_limit as f64 * 100.0
    } else {
        0.0
    };

    let (mut network_rx, mut network_tx) = (0u64, 0u64);
    if let Some(networks) = &stats.networks {
        for network in networks.values() {
            network_rx += network.rx_bytes;
            network_tx += network.tx_bytes;
        }
    }

    let (mut block_read, mut block_write) = (0u64, 0u64);
    if let Some(entries) = &stats.blkio_stats.io_service_bytes_recursive {
        for entry in entries {
            if entry.op.eq_ignore_ascii_case("read") {
                block_read += entry.value;
            } else if entry.op.eq_ignore_ascii_case("write") {
                block_write += entry.value;
            }
        }
    }

    ContainerStats {
        cpu_percent,
        memory_usage,
        memory_limit,
        memory_percent,
        network_rx,
        network_tx,
        block_read,
        block_write,
        pids: stats.pids_stats.current.unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::PortTypeEnum;

    #[tokio::test]
    async fn pods_are_always_an_empty_collection() {
        // Construction survives an unreachable daemon; the failed ping is
        // only a warning, so no engine needs to be running here.
        let runtime = DockerRuntime::connect(Some("/nonexistent/docker.sock"))
            .await
            .unwrap();

        let pods = runtime.list_pods(&FilterOptions::default()).await.unwrap();
        assert!(pods.is_empty());

        let filter = FilterOptions {
            name: Some("web".to_string()),
            status: Some("running".to_string()),
            include_stats: true,
            include_privileged: true,
            ..Default::default()
        };
        let pods = runtime.list_pods(&filter).await.unwrap();
        assert!(pods.is_empty());
    }

    #[test]
    fn cpu_percent_is_zero_without_positive_deltas() {
        // Zero system delta.
        assert_eq!(cpu_percent(200, 100, 1000, 1000, 4), 0.0);
        // Negative system delta (counter reset).
        assert_eq!(cpu_percent(200, 100, 900, 1000, 4), 0.0);
        // Zero usage delta.
        assert_eq!(cpu_percent(100, 100, 2000, 1000, 4), 0.0);
        // Negative usage delta.
        assert_eq!(cpu_percent(50, 100, 2000, 1000, 4), 0.0);
    }

    #[test]
    fn cpu_percent_scales_by_online_cpus() {
        // 50% of one cpu's share of system time across 4 cpus.
        let percent = cpu_percent(1500, 1000, 2000, 1000, 4);
        assert!((percent - 200.0).abs() < f64::EPSILON);

        // Zero online cpus reports zero usage rather than NaN.
        assert_eq!(cpu_percent(1500, 1000, 2000, 1000, 0), 0.0);
    }

    #[test]
    fn ports_translate_to_the_shared_shape() {
        let ports = vec![
            Port {
                ip: None,
                private_port: 80,
                public_port: Some(8080),
                typ: Some(PortTypeEnum::TCP),
            },
            Port {
                ip: None,
                private_port: 53,
                public_port: None,
                typ: Some(PortTypeEnum::UDP),
            },
        ];

        let mapped = map_ports(ports);
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].container_port, 80);
        assert_eq!(mapped[0].host_port, 8080);
        assert_eq!(mapped[0].protocol, "tcp");
        // Unpublished port becomes a zero-value, not a crash.
        assert_eq!(mapped[1].host_port, 0);
        assert_eq!(mapped[1].protocol, "udp");
    }

}
