//! wharfd - container management daemon
//!
//! Wires the runtime backends, update scheduler, and proxy lifecycle
//! manager together and exposes health probes over HTTP.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wharf_core::{
    Config, DockerRuntime, PodmanRuntime, ProxyManager, RuntimeRegistry, UpdateJobConfig,
    UpdateScheduler,
};

mod api;

const WHARFD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var_os("WHARF_CONFIG").map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing with JSON output and env filter
    let default_filter = if config.server.mode == "debug" {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(fmt::layer().json())
        .init();

    info!(version = WHARFD_VERSION, "Starting wharfd");

    // A missing engine is a warning; having no engine at all is fatal.
    let registry = Arc::new(RuntimeRegistry::new());
    if config.docker.enabled {
        match DockerRuntime::connect(config.docker.socket.as_deref()).await {
            Ok(runtime) => registry.register("docker", Arc::new(runtime)),
            Err(error) => warn!(error = %error, "Docker backend unavailable"),
        }
    }
    if config.podman.enabled {
        match PodmanRuntime::connect(config.podman.socket.as_deref()).await {
            Ok(runtime) => registry.register("podman", Arc::new(runtime)),
            Err(error) => warn!(error = %error, "Podman backend unavailable"),
        }
    }
    if registry.is_empty() {
        bail!("no container engine available; enable and start docker or podman");
    }
    info!(backends = registry.len(), "Runtime backends registered");

    let scheduler = Arc::new(UpdateScheduler::new(Arc::clone(&registry)));
    scheduler
        .update_config(UpdateJobConfig {
            schedule: config.scheduler.schedule.clone(),
            enabled: config.scheduler.enabled,
            filters: config.scheduler.filters.clone(),
        })
        .await?;

    let proxy = Arc::new(ProxyManager::new(config.proxy.clone()));

    let state = Arc::new(api::AppState::new(
        Arc::clone(&registry),
        Arc::clone(&scheduler),
        Arc::clone(&proxy),
    ));
    let api_handle = tokio::spawn(api::serve(config.server.port, state));

    tokio::select! {
        result = api_handle => result??,
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
    }

    Ok(())
}
