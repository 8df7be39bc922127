//! The container adapter: the capability the runner uses to drive client
//! containers, plus the resource-stats readers.

pub(crate) mod cli_runtime;
pub(crate) mod stats;

use crate::{config::PullPolicy, resources::ResourceLimits};
use color_eyre::Result;
use std::{collections::BTreeMap, path::PathBuf};

/// A bind mount into the client container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Mount {
    /// The host path.
    pub(crate) host: PathBuf,
    /// The container path.
    pub(crate) container: PathBuf,
    /// Whether the mount is read-only.
    pub(crate) read_only: bool,
}

/// Everything needed to start a client container.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContainerSpec {
    /// The container name.
    pub(crate) name: String,
    /// The image reference.
    pub(crate) image: String,
    /// The image pull policy.
    pub(crate) pull_policy: PullPolicy,
    /// The bridge network to attach to.
    pub(crate) network: String,
    /// An entrypoint override.
    pub(crate) entrypoint: Option<Vec<String>>,
    /// The command (and trailing extra args).
    pub(crate) command: Vec<String>,
    /// Environment variables.
    pub(crate) environment: BTreeMap<String, String>,
    /// Bind mounts.
    pub(crate) mounts: Vec<Mount>,
    /// The Engine-API port inside the container, published to an ephemeral
    /// host port.
    pub(crate) engine_port: u16,
    /// Container-level resource limits.
    pub(crate) limits: Option<ResourceLimits>,
}

/// The observed exit state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ContainerState {
    /// The exit code, when exited.
    pub(crate) exit_code: i64,
    /// Whether the kernel OOM killer terminated it.
    pub(crate) oom_killed: bool,
}

/// The capability the runner consumes to manage one client container.
#[async_trait::async_trait]
pub(crate) trait ContainerAdapter: Send + Sync {
    /// Starts the container described by the spec.
    async fn start(&self, spec: &ContainerSpec) -> Result<()>;

    /// Stops and removes the container.
    async fn stop(&self) -> Result<()>;

    /// Stops the container and starts a fresh one with the same spec (the
    /// data volume persists).
    async fn recreate(&self, spec: &ContainerSpec) -> Result<()>;

    /// Takes a CRIU checkpoint image, leaving the container running.
    async fn checkpoint(&self, image_path: &std::path::Path) -> Result<()>;

    /// Restores the container from a checkpoint image.
    async fn restore(&self, image_path: &std::path::Path) -> Result<()>;

    /// Inspects the container's exit state.
    async fn inspect(&self) -> Result<ContainerState>;

    /// The host port the engine port is published on.
    async fn mapped_engine_port(&self, engine_port: u16) -> Result<u16>;

    /// Blocks until the container exits, returning its exit code.
    async fn wait_exit(&self) -> Result<i64>;
}
