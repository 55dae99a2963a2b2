//! Core library for the wharf container manager
//!
//! This crate provides the core functionality for:
//! - A normalized container/pod data model shared across engines
//! - Runtime backends for Docker and Podman behind one trait
//! - A registry routing requests to named backends
//! - A cron-driven container update scheduler
//! - A label-driven reverse-proxy lifecycle manager

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod runtime;
pub mod scheduler;

pub use config::Config;
pub use error::{Error, Result};
pub use models::*;
pub use proxy::ProxyManager;
pub use runtime::{
    async_trait, ContainerRuntime, DockerRuntime, LogStream, PodmanRuntime, RuntimeRegistry,
};
pub use scheduler::UpdateScheduler;
