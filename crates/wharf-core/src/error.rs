//! Error taxonomy shared by all core subsystems
//!
//! Callers (the HTTP layer, the scheduler sweep) rely on the variants to
//! distinguish invalid requests from downstream failures from legitimate
//! no-ops, so new failure modes should extend this enum rather than being
//! stringified into an existing variant.

use crate::models::Engine;

/// Errors produced by runtime backends, the scheduler, and the proxy manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Engine API call failed (connection refused, timeout, daemon error).
    /// Transient failures are never retried inside the core.
    #[error("container engine API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// Unable to establish a connection to an engine after exhausting all
    /// candidate transports.
    #[error("unable to connect to {engine} socket: {detail}")]
    Connection { engine: Engine, detail: String },

    /// The referenced container, pod, or route does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine cannot perform this operation at all (pods on Docker,
    /// label mutation on a running Docker container).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The caller's request was malformed (bad cron expression, missing
    /// label-derived field).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A CLI subprocess exited non-zero; output is captured for diagnosis.
    #[error("command `{command}` failed: {output}")]
    Command { command: String, output: String },

    /// Direct route content access while the proxy integration is disabled.
    /// Lifecycle hooks are silent no-ops instead; only the explicit
    /// read/write API reports this.
    #[error("reverse proxy integration is not enabled")]
    ProxyDisabled,

    /// An engine did not answer within the probe deadline.
    #[error("operation timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
