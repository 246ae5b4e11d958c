//! Configuration parsing for codebox.toml files.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::validation;

/// Root configuration structure matching the codebox.toml schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Image the container is created from
    #[serde(default = "default_image")]
    pub image: String,
    /// Host directory bind-mounted into the container
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Wall-clock bound for one `execute` call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bound for reaching the runtime and waiting for the container
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Remove the container on stop (otherwise it is only stopped)
    #[serde(default = "default_true")]
    pub auto_remove: bool,
    /// Delete code files after each execute call
    #[serde(default)]
    pub delete_tmp_files: bool,
    /// Delete the working directory on stop
    #[serde(default)]
    pub remove_work_dir_on_stop: bool,
    /// Quieten `pip install` lines
    #[serde(default = "default_true")]
    pub silence_pip: bool,
    /// Fixed container name (default: codebox-<random>)
    #[serde(default)]
    pub container_name: Option<String>,
    /// Shell command run once after the container is up
    #[serde(default)]
    pub init_command: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            work_dir: default_work_dir(),
            timeout_secs: default_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            auto_remove: true,
            delete_tmp_files: false,
            remove_work_dir_on_stop: false,
            silence_pip: true,
            container_name: None,
            init_command: None,
        }
    }
}

fn default_image() -> String {
    "python:3-slim".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("coding")
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Container runtime CLI to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Get the command name for this runtime
    pub fn cmd(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "podman" => Ok(RuntimeKind::Podman),
            _ => Err(format!(
                "Unknown runtime '{}'. Valid options: docker, podman",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kind: RuntimeKind,
    /// Runtime endpoint, handed to the CLI as DOCKER_HOST. No default:
    /// when unset the CLI resolves its own.
    #[serde(default)]
    pub docker_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Network access inside the container
    #[serde(default = "default_true")]
    pub network: bool,
    /// Memory limit in MB (None = runtime default)
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// CPU limit as fraction of cores (None = runtime default)
    #[serde(default)]
    pub cpus: Option<f64>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            network: true,
            memory_mb: None,
            cpus: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    /// JSONL file (default: ~/.codebox/audit.jsonl)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that end up on the runtime command line.
    pub fn validate(&self) -> Result<()> {
        validation::validate_docker_image(&self.executor.image)?;

        if self.executor.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }
        if self.executor.startup_timeout_secs == 0 {
            bail!("startup_timeout_secs must be at least 1");
        }
        if self.executor.work_dir.as_os_str().is_empty() {
            bail!("work_dir cannot be empty");
        }
        if let Some(ref name) = self.executor.container_name {
            validation::validate_container_name(name)?;
        }
        if let Some(ref host) = self.runtime.docker_host {
            validation::validate_docker_host(host)?;
        }
        if let Some(cpus) = self.resources.cpus
            && cpus <= 0.0
        {
            bail!("cpus must be greater than 0");
        }
        for key in self.environment.keys() {
            validation::validate_env_key(key)?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.startup_timeout_secs)
    }

    /// Starter file written by `codebox init`.
    pub fn starter_toml() -> String {
        r#"# codebox configuration

[executor]
image = "python:3-slim"
work_dir = "coding"
timeout_secs = 60
auto_remove = true
# init_command = "pip install -qqq pandas scikit-learn"

[runtime]
kind = "docker"    # docker, podman
# docker_host = "unix:///var/run/docker.sock"

[resources]
network = true
# memory_mb = 1024
# cpus = 1.0

[audit]
enabled = false
"#
        .to_string()
    }
}
