//! Runtime backends behind one engine-agnostic contract
//!
//! Each backend integrates one container engine and returns normalized
//! records; the registry routes requests to named backends. Adding a third
//! engine means writing one new backend, not touching callers.

mod docker;
mod podman;

pub use docker::DockerRuntime;
pub use podman::PodmanRuntime;

use crate::error::{Error, Result};
use crate::models::{
    ContainerRecord, Engine, EngineSelector, FilterOptions, PodRecord, RunRequest,
};
use bollard::models::{PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::Command;

pub use async_trait::async_trait;

/// Byte stream of container log output. Dropping the stream releases the
/// underlying engine connection, even mid-stream.
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// The fixed capability set every engine backend implements.
///
/// Cancellation is expressed by dropping the returned future or stream; the
/// only blocking points are engine API calls and CLI subprocesses.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// The engine this backend integrates.
    fn engine(&self) -> Engine;

    /// List containers as normalized snapshots, including stopped ones.
    async fn list_containers(&self, filter: &FilterOptions) -> Result<Vec<ContainerRecord>>;

    /// List pods. The Docker backend returns an empty collection, never an
    /// error.
    async fn list_pods(&self, filter: &FilterOptions) -> Result<Vec<PodRecord>>;

    async fn delete_container(&self, id: &str, force: bool) -> Result<()>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn restart_container(&self, id: &str) -> Result<()>;

    async fn delete_pod(&self, id: &str, force: bool) -> Result<()>;
    async fn start_pod(&self, id: &str) -> Result<()>;
    async fn stop_pod(&self, id: &str) -> Result<()>;
    async fn restart_pod(&self, id: &str) -> Result<()>;

    /// Build an image from Dockerfile text.
    async fn build_image(&self, dockerfile: &str, image_name: &str) -> Result<()>;

    /// Create and start a container, returning its id.
    async fn run_container(&self, request: &RunRequest) -> Result<String>;

    /// Deploy a compose file through the engine's compose CLI. When
    /// `deploy_dir` is given the file is persisted there; otherwise it is
    /// staged in a scratch directory.
    async fn deploy_compose(
        &self,
        compose: &str,
        project_name: &str,
        deploy_dir: Option<&Path>,
    ) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Pull the latest image for a container and recreate it.
    ///
    /// A failure after the old container is removed but before the new one
    /// starts leaves the container absent; there is no rollback.
    async fn update_container(&self, id: &str) -> Result<()>;

    /// Stream container logs, optionally following and bounded by `tail`.
    async fn stream_logs(&self, id: &str, follow: bool, tail: Option<u64>) -> Result<LogStream>;

    /// Set or update labels on a container. Engines that cannot mutate
    /// labels on an existing container return an explicit error.
    async fn set_labels(&self, id: &str, labels: &HashMap<String, String>) -> Result<()>;

    /// Remove labels from a container.
    async fn remove_labels(&self, id: &str, keys: &[String]) -> Result<()>;
}

/// Registry of named runtime backends.
///
/// Pure routing: no retry or merge logic. Callers decide how to combine
/// per-backend results. Registering an existing name replaces the prior
/// binding; there is no unregister.
#[derive(Default)]
pub struct RuntimeRegistry {
    backends: DashMap<String, Arc<dyn ContainerRuntime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn ContainerRuntime>) {
        let name = name.into();
        tracing::debug!(backend = %name, "Registering runtime backend");
        self.backends.insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContainerRuntime>> {
        self.backends.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all registered backends by name.
    pub fn all(&self) -> HashMap<String, Arc<dyn ContainerRuntime>> {
        self.backends
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Backends covered by an engine selector, in name order.
    pub fn selected(&self, selector: EngineSelector) -> Vec<(String, Arc<dyn ContainerRuntime>)> {
        let mut backends: Vec<_> = self
            .backends
            .iter()
            .filter(|entry| selector.selects(entry.value().engine()))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        backends.sort_by(|left, right| left.0.cmp(&right.0));
        backends
    }

    /// List containers across every backend the filter selects.
    ///
    /// A failing backend is logged with its name and skipped; the batch
    /// continues with the remaining backends.
    pub async fn list_containers(&self, filter: &FilterOptions) -> Vec<ContainerRecord> {
        let mut records = Vec::new();
        for (name, backend) in self.selected(filter.engine) {
            match backend.list_containers(filter).await {
                Ok(containers) => records.extend(containers),
                Err(error) => {
                    tracing::error!(backend = %name, error = %error, "Backend failed during container listing")
                }
            }
        }
        records
    }

    /// List pods across every backend the filter selects, with the same
    /// continue-on-failure semantics as [`list_containers`].
    ///
    /// [`list_containers`]: RuntimeRegistry::list_containers
    pub async fn list_pods(&self, filter: &FilterOptions) -> Vec<PodRecord> {
        let mut records = Vec::new();
        for (name, backend) in self.selected(filter.engine) {
            match backend.list_pods(filter).await {
                Ok(pods) => records.extend(pods),
                Err(error) => {
                    tracing::error!(backend = %name, error = %error, "Backend failed during pod listing")
                }
            }
        }
        records
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// A parsed `host:container[/protocol]` port specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortSpec {
    pub host_port: String,
    pub container_port: String,
    pub protocol: String,
}

impl PortSpec {
    /// Key in the engine's `port/protocol` exposed-port format.
    pub fn engine_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Parse a `host:container[/protocol]` mapping; protocol defaults to tcp.
pub(crate) fn parse_port_spec(spec: &str) -> Option<PortSpec> {
    let (host, rest) = spec.split_once(':')?;
    let (container, protocol) = match rest.split_once('/') {
        Some((container, protocol)) => (container, protocol),
        None => (rest, "tcp"),
    };
    if host.is_empty() || container.is_empty() {
        return None;
    }
    Some(PortSpec {
        host_port: host.to_string(),
        container_port: container.to_string(),
        protocol: protocol.to_string(),
    })
}

/// Build an in-memory tar archive holding a single Dockerfile, suitable as
/// an image build context.
pub(crate) fn dockerfile_context(dockerfile: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    Ok(builder.into_inner()?)
}

/// Write compose content to `deploy_dir` (persisted) or a scratch directory.
/// The returned `TempDir` guard must outlive the compose CLI invocation.
pub(crate) async fn stage_compose_file(
    compose: &str,
    deploy_dir: Option<&Path>,
) -> Result<(PathBuf, Option<TempDir>)> {
    match deploy_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            let path = dir.join("docker-compose.yml");
            tokio::fs::write(&path, compose).await?;
            Ok((path, None))
        }
        None => {
            let scratch = tempfile::tempdir()?;
            let path = scratch.path().join("docker-compose.yml");
            tokio::fs::write(&path, compose).await?;
            Ok((path, Some(scratch)))
        }
    }
}

/// Run a CLI subprocess, surfacing non-zero exits with combined output.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(Error::Command {
            command: format!("{program} {}", args.join(" ")),
            output: combined.trim().to_string(),
        })
    }
}

/// Whether a binary with the given name exists on the search path.
pub(crate) fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

/// Strip the engine-specific leading separator from a container name.
pub(crate) fn normalize_name(name: &str) -> String {
    name.trim_start_matches('/').to_string()
}

/// Engine-shaped port and volume wiring derived from a [`RunRequest`].
#[derive(Debug, Default)]
pub(crate) struct RunPlan {
    pub exposed_ports: HashMap<String, HashMap<(), ()>>,
    pub port_bindings: HashMap<String, Option<Vec<PortBinding>>>,
    pub binds: Vec<String>,
    /// Bind sources that name volumes rather than host paths and may need
    /// to be created before the container.
    pub named_volumes: Vec<String>,
}

/// Translate the request's port and volume mappings into engine shapes.
/// A malformed port mapping is an input error; a volume entry without a
/// destination is skipped.
pub(crate) fn plan_run(request: &RunRequest) -> Result<RunPlan> {
    let mut plan = RunPlan::default();

    for spec in &request.ports {
        let Some(port) = parse_port_spec(spec) else {
            return Err(Error::InvalidInput(format!(
                "invalid port mapping {spec:?}; expected host:container[/protocol]"
            )));
        };
        plan.exposed_ports.insert(port.engine_key(), HashMap::new());
        plan.port_bindings.insert(
            port.engine_key(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host_port),
            }]),
        );
    }

    for volume in &request.volumes {
        let Some((source, _)) = volume.split_once(':') else {
            continue;
        };
        if !source.starts_with('/') && !source.starts_with('.') {
            plan.named_volumes.push(source.to_string());
        }
        plan.binds.push(volume.clone());
    }

    Ok(plan)
}

/// Map a restart policy name to the engine enum; unknown names are logged
/// and dropped rather than rejected.
pub(crate) fn restart_policy(policy: Option<&str>) -> Option<RestartPolicy> {
    let name = match policy? {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        other => {
            tracing::warn!(policy = other, "Unknown restart policy; ignoring");
            return None;
        }
    };
    Some(RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PodRecord;

    struct StubRuntime {
        engine: Engine,
        fail: bool,
    }

    impl StubRuntime {
        fn ok(engine: Engine) -> Self {
            Self {
                engine,
                fail: false,
            }
        }

        fn failing(engine: Engine) -> Self {
            Self { engine, fail: true }
        }

        fn record(&self) -> ContainerRecord {
            ContainerRecord {
                id: format!("{}-1", self.engine),
                name: format!("{}-container", self.engine),
                image: "img".to_string(),
                status: "Up".to_string(),
                state: "running".to_string(),
                engine: self.engine,
                created: chrono::Utc::now(),
                labels: HashMap::new(),
                ports: Vec::new(),
                privileged: None,
                stats: None,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for StubRuntime {
        fn engine(&self) -> Engine {
            self.engine
        }

        async fn list_containers(&self, _filter: &FilterOptions) -> Result<Vec<ContainerRecord>> {
            if self.fail {
                return Err(Error::Unsupported("stub failure".into()));
            }
            Ok(vec![self.record()])
        }

        async fn list_pods(&self, _filter: &FilterOptions) -> Result<Vec<PodRecord>> {
            if self.fail {
                return Err(Error::Unsupported("stub failure".into()));
            }
            match self.engine {
                Engine::Podman => Ok(vec![PodRecord {
                    id: "pod-1".to_string(),
                    name: "pod".to_string(),
                    status: "Running".to_string(),
                    created: chrono::Utc::now(),
                    containers: Vec::new(),
                    engine: self.engine,
                }]),
                Engine::Docker => Ok(Vec::new()),
            }
        }

        async fn delete_container(&self, _id: &str, _force: bool) -> Result<()> {
            Ok(())
        }

        async fn start_container(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn stop_container(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn restart_container(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_pod(&self, _id: &str, _force: bool) -> Result<()> {
            Ok(())
        }

        async fn start_pod(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn stop_pod(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn restart_pod(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn build_image(&self, _dockerfile: &str, _image_name: &str) -> Result<()> {
            Ok(())
        }

        async fn run_container(&self, _request: &RunRequest) -> Result<String> {
            Ok(String::new())
        }

        async fn deploy_compose(
            &self,
            _compose: &str,
            _project_name: &str,
            _deploy_dir: Option<&Path>,
        ) -> Result<()> {
            Ok(())
        }

        async fn pull_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }

        async fn update_container(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn stream_logs(
            &self,
            _id: &str,
            _follow: bool,
            _tail: Option<u64>,
        ) -> Result<LogStream> {
            Ok(Box::pin(futures_util::stream::empty()))
        }

        async fn set_labels(&self, _id: &str, _labels: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }

        async fn remove_labels(&self, _id: &str, _keys: &[String]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_routes_by_name() {
        let registry = RuntimeRegistry::new();
        assert!(registry.is_empty());

        registry.register("docker", Arc::new(StubRuntime::ok(Engine::Docker)));
        registry.register("podman", Arc::new(StubRuntime::ok(Engine::Podman)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("docker").unwrap().engine(), Engine::Docker);
        assert_eq!(registry.get("podman").unwrap().engine(), Engine::Podman);
        assert!(registry.get("containerd").is_none());

        let all = registry.all();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("docker"));
    }

    #[test]
    fn registry_reregister_replaces_binding() {
        let registry = RuntimeRegistry::new();
        registry.register("engine", Arc::new(StubRuntime::ok(Engine::Docker)));
        registry.register("engine", Arc::new(StubRuntime::ok(Engine::Podman)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("engine").unwrap().engine(), Engine::Podman);
    }

    #[tokio::test]
    async fn aggregate_listing_honors_the_engine_selector() {
        let registry = RuntimeRegistry::new();
        registry.register("docker", Arc::new(StubRuntime::ok(Engine::Docker)));
        registry.register("podman", Arc::new(StubRuntime::ok(Engine::Podman)));

        let all = registry.list_containers(&FilterOptions::default()).await;
        assert_eq!(all.len(), 2);

        let docker_only = registry
            .list_containers(&FilterOptions {
                engine: EngineSelector::Docker,
                ..Default::default()
            })
            .await;
        assert_eq!(docker_only.len(), 1);
        assert_eq!(docker_only[0].engine, Engine::Docker);

        // Docker has no pods; only the Podman backend contributes.
        let pods = registry.list_pods(&FilterOptions::default()).await;
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].engine, Engine::Podman);
    }

    #[tokio::test]
    async fn aggregate_listing_continues_past_a_failing_backend() {
        let registry = RuntimeRegistry::new();
        registry.register("docker", Arc::new(StubRuntime::failing(Engine::Docker)));
        registry.register("podman", Arc::new(StubRuntime::ok(Engine::Podman)));

        let records = registry.list_containers(&FilterOptions::default()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].engine, Engine::Podman);
    }

    #[test]
    fn port_spec_parses_host_container_pairs() {
        let spec = parse_port_spec("8080:80").unwrap();
        assert_eq!(spec.host_port, "8080");
        assert_eq!(spec.container_port, "80");
        assert_eq!(spec.protocol, "tcp");
        assert_eq!(spec.engine_key(), "80/tcp");

        let spec = parse_port_spec("5353:53/udp").unwrap();
        assert_eq!(spec.protocol, "udp");
        assert_eq!(spec.engine_key(), "53/udp");

        assert!(parse_port_spec("8080").is_none());
        assert!(parse_port_spec(":80").is_none());
        assert!(parse_port_spec("8080:").is_none());
    }

    #[test]
    fn dockerfile_context_is_a_tar_with_one_entry() {
        let content = "FROM alpine:3.19\n";
        let archive = dockerfile_context(content).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "Dockerfile");
        assert_eq!(entry.size(), content.len() as u64);
        assert!(entries.next().is_none());
    }

    #[test]
    fn normalize_name_strips_leading_separator() {
        assert_eq!(normalize_name("/web"), "web");
        assert_eq!(normalize_name("web"), "web");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn plan_run_separates_named_volumes_from_host_paths() {
        let request = RunRequest {
            name: "web".to_string(),
            image: "nginx:1.25".to_string(),
            ports: vec!["8080:80".to_string()],
            volumes: vec![
                "data:/var/lib/data".to_string(),
                "/host/logs:/var/log".to_string(),
                "./conf:/etc/conf".to_string(),
            ],
            ..Default::default()
        };

        let plan = plan_run(&request).unwrap();
        assert_eq!(plan.named_volumes, vec!["data"]);
        assert_eq!(plan.binds.len(), 3);
        assert!(plan.exposed_ports.contains_key("80/tcp"));
        let binding = plan.port_bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn plan_run_rejects_malformed_port_mappings() {
        let request = RunRequest {
            ports: vec!["eighty".to_string()],
            ..Default::default()
        };
        assert!(matches!(plan_run(&request), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn restart_policy_maps_known_names() {
        assert_eq!(
            restart_policy(Some("always")).unwrap().name,
            Some(RestartPolicyNameEnum::ALWAYS)
        );
        assert_eq!(
            restart_policy(Some("unless-stopped")).unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
        assert!(restart_policy(Some("sometimes")).is_none());
        assert!(restart_policy(None).is_none());
    }
}
