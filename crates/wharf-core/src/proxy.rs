//! Label-driven reverse-proxy lifecycle
//!
//! Containers opt into routing through `proxy.*` labels; each routed
//! container gets one generated Caddy fragment file in an operator-chosen
//! directory, written on observation and removed when the container goes
//! away. The fragment set on disk is the whole of this subsystem's durable
//! state.
//!
//! Lifecycle hooks are silent no-ops while the subsystem is disabled;
//! direct fragment reads and writes instead fail with a distinct error so
//! an API caller learns why nothing is happening.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::models::ContainerRecord;
use crate::runtime::run_command;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

const FRAGMENT_PREFIX: &str = "wharf-";
const FRAGMENT_SUFFIX: &str = ".caddy";

/// Keeps proxy fragments in step with container lifecycle events.
pub struct ProxyManager {
    config: RwLock<ProxyConfig>,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Swap in a new configuration; takes effect on the next operation.
    pub async fn update_config(&self, config: ProxyConfig) {
        *self.config.write().await = config;
    }

    pub async fn is_enabled(&self) -> bool {
        self.config.read().await.enabled
    }

    /// React to a container being observed (started, created, or listed).
    ///
    /// A container without a `proxy.domain` label has no routing intent;
    /// that is success, not an error. A routed container missing any usable
    /// upstream port is an input error.
    pub async fn sync_container(&self, container: &ContainerRecord) -> Result<()> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Ok(());
        }

        let Some(domain) = container.labels.get("proxy.domain") else {
            return Ok(());
        };

        let port = match container.labels.get("proxy.port") {
            Some(port) => port.clone(),
            None => container
                .ports
                .iter()
                .find(|port| port.host_port != 0)
                .map(|port| port.host_port.to_string())
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "container {} has a proxy.domain label but no usable port",
                        container.name
                    ))
                })?,
        };
        let path_prefix = container
            .labels
            .get("proxy.path")
            .map(String::as_str)
            .unwrap_or("/");
        let tls = container
            .labels
            .get("proxy.tls")
            .map(String::as_str)
            .unwrap_or("auto");

        let fragment = render_fragment(domain, &port, path_prefix, tls);
        let path = fragment_path(&config.fragment_dir, &container.id);
        write_fragment(&path, &fragment).await?;
        info!(container = %container.name, domain = %domain, "Proxy route written");

        if config.auto_reload {
            reload_with(&config).await?;
        }
        Ok(())
    }

    /// React to a container going away. Removing a route that was never
    /// created is success.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        self.delete_route(id).await
    }

    /// Delete a container's fragment if present.
    pub async fn delete_route(&self, id: &str) -> Result<()> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Ok(());
        }

        let path = fragment_path(&config.fragment_dir, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(container_id = id, "Proxy route removed");
                if config.auto_reload {
                    reload_with(&config).await?;
                }
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Read a fragment back verbatim.
    pub async fn get_route_text(&self, id: &str) -> Result<String> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Err(Error::ProxyDisabled);
        }

        let path = fragment_path(&config.fragment_dir, id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("no proxy route for container {id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Overwrite a fragment with operator-supplied text.
    pub async fn set_route_text(&self, id: &str, text: &str) -> Result<()> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Err(Error::ProxyDisabled);
        }

        let path = fragment_path(&config.fragment_dir, id);
        write_fragment(&path, text).await?;
        if config.auto_reload {
            reload_with(&config).await?;
        }
        Ok(())
    }

    /// Container ids that currently have a fragment on disk.
    pub async fn list_routes(&self) -> Result<Vec<String>> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Ok(Vec::new());
        }

        let mut entries = match tokio::fs::read_dir(&config.fragment_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_prefix(FRAGMENT_PREFIX) {
                if let Some(id) = stem.strip_suffix(FRAGMENT_SUFFIX) {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Ask the proxy server to reload its configuration.
    pub async fn reload(&self) -> Result<()> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Ok(());
        }
        reload_with(&config).await
    }
}

fn fragment_path(dir: &str, container_id: &str) -> PathBuf {
    Path::new(dir).join(format!("{FRAGMENT_PREFIX}{container_id}{FRAGMENT_SUFFIX}"))
}

/// Write a fragment world-readable so the proxy server's user can load it.
async fn write_fragment(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
    }
    Ok(())
}

async fn reload_with(config: &ProxyConfig) -> Result<()> {
    let mut command: Vec<&str> = match config.reload_method.as_str() {
        "systemctl" => vec!["systemctl", "reload", "caddy"],
        _ => vec![config.binary_path.as_str(), "reload"],
    };
    if config.use_sudo {
        command.insert(0, "sudo");
    }

    run_command(command[0], &command[1..]).await?;
    debug!("Proxy reloaded");
    Ok(())
}

/// Render one site block for a routed container.
///
/// TLS `auto` uses the proxy's internal issuer, `off` omits the directive,
/// and any other value is passed through as a certificate reference. A
/// non-root path prefix scopes the upstream behind a stripping handler.
fn render_fragment(domain: &str, port: &str, path_prefix: &str, tls: &str) -> String {
    let mut out = String::new();
    out.push_str(domain);
    out.push_str(" {\n");

    match tls {
        "off" => {}
        "auto" => out.push_str("\ttls internal\n"),
        other => {
            out.push_str("\ttls ");
            out.push_str(other);
            out.push('\n');
        }
    }

    if path_prefix != "/" {
        out.push_str(&format!("\thandle_path {path_prefix}* {{\n"));
        out.push_str(&format!("\t\treverse_proxy localhost:{port}\n"));
        out.push_str("\t}\n");
    } else {
        out.push_str(&format!("\treverse_proxy localhost:{port}\n"));
    }

    out.push_str("}\n");
    out
}
