//! Host container runtime abstraction.
//!
//! The executor only needs a handful of primitives from the runtime:
//! reachability, image presence, create, exec, interrupt and destroy.
//! [`DockerCli`] implements them by driving the `docker`/`podman` CLI.

pub mod docker;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

pub use docker::DockerCli;

/// Mount point of the working directory inside the container
pub const CONTAINER_WORK_DIR: &str = "/workspace";

/// Everything needed to create the session container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image to create the container from (e.g., "python:3-slim")
    pub image: String,
    /// Absolute host path bind-mounted at [`CONTAINER_WORK_DIR`]
    pub host_work_dir: PathBuf,
    /// Remove the container on exit (`--rm`)
    pub auto_remove: bool,
    /// Network access enabled
    pub network: bool,
    /// Memory in MB
    pub memory_mb: Option<u64>,
    /// CPU limit as fraction of cores
    pub cpus: Option<f64>,
    /// Environment variables to set
    pub env: Vec<(String, String)>,
}

/// Captured result of one command run inside the container
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Primitives of the host runtime the executor is built on.
///
/// Implementations must make `exec` futures cancel-safe: dropping the
/// future must not leave a host-side child process behind.
#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// Short name for logs ("docker", "podman", ...)
    fn name(&self) -> &str;

    /// Check that the runtime answers at all
    async fn ping(&self) -> Result<()>;

    /// Make sure the image is available locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create and start a detached container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Whether the container is currently running
    async fn is_running(&self, container: &str) -> Result<bool>;

    /// Run a command in the container with [`CONTAINER_WORK_DIR`] as cwd
    async fn exec(&self, container: &str, argv: &[String]) -> Result<RawOutput>;

    /// Best-effort kill of in-container processes whose command line
    /// matches `pattern`, used after a host-side timeout
    async fn interrupt(&self, container: &str, pattern: &str) -> Result<()>;

    /// Destroy the container. `remove` force-removes it; otherwise it is
    /// stopped and left for inspection.
    async fn destroy(&self, container: &str, remove: bool) -> Result<()>;

    /// Synchronous force-remove, used from `Drop` when the owner is gone
    fn destroy_blocking(&self, container: &str);
}
