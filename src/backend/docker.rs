//! Docker/Podman CLI implementation of [`HostRuntime`].

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CONTAINER_WORK_DIR, ContainerSpec, HostRuntime, RawOutput};
use crate::config::{RuntimeConfig, RuntimeKind};

/// Label put on every container this crate creates
const LABEL_MANAGED_BY: &str = "codebox.managed=true";

/// Keeps the container alive between exec calls
const KEEPALIVE_SCRIPT: &str = "while true; do sleep 3600; done";

/// SIGKILL every process whose command line contains `$1`. Walks `/proc`
/// directly since slim images ship without procps.
const KILL_MATCHING_SCRIPT: &str = r#"for p in /proc/[0-9]*; do
  pid=${p#/proc/}
  [ "$pid" = "$$" ] && continue
  case "$(tr '\0' ' ' 2>/dev/null < "$p/cmdline")" in
    *"$1"*) kill -9 "$pid" 2>/dev/null ;;
  esac
done
exit 0"#;

/// Container runtime driven through its command-line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    runtime: RuntimeKind,
    host: Option<String>,
}

impl DockerCli {
    pub fn new(runtime: RuntimeKind) -> Self {
        Self {
            runtime,
            host: None,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            runtime: config.kind,
            host: config.docker_host.clone(),
        }
    }

    /// Point the CLI at an explicit endpoint. Only the child processes see it.
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Environment variable the CLI reads its endpoint from
    fn host_env_var(&self) -> &'static str {
        match self.runtime {
            RuntimeKind::Docker => "DOCKER_HOST",
            RuntimeKind::Podman => "CONTAINER_HOST",
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.runtime.cmd());
        if let Some(ref host) = self.host {
            cmd.env(self.host_env_var(), host);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[String]) -> Result<RawOutput> {
        debug!("{} {}", self.runtime.cmd(), args.join(" "));
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run '{}'", self.runtime.cmd()))?;

        Ok(RawOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_checked(&self, args: &[String], what: &str) -> Result<RawOutput> {
        let output = self.run(args).await?;
        if !output.is_success() {
            bail!("{} failed: {}", what, output.stderr.trim());
        }
        Ok(output)
    }
}

/// Arguments for `docker run` that create the session container.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "-d".to_string()];

    if spec.auto_remove {
        args.push("--rm".to_string());
    }

    args.extend([
        "--name".to_string(),
        spec.name.clone(),
        "--label".to_string(),
        LABEL_MANAGED_BY.to_string(),
        "-v".to_string(),
        format!("{}:{}", spec.host_work_dir.display(), CONTAINER_WORK_DIR),
        "-w".to_string(),
        CONTAINER_WORK_DIR.to_string(),
    ]);

    if !spec.network {
        args.push("--network=none".to_string());
    }
    if let Some(mem) = spec.memory_mb {
        args.push(format!("--memory={}m", mem));
    }
    if let Some(cpus) = spec.cpus {
        args.push(format!("--cpus={}", cpus));
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    // Override the entrypoint so the container idles until exec'd into
    args.extend([
        "--entrypoint".to_string(),
        "/bin/sh".to_string(),
        spec.image.clone(),
        "-c".to_string(),
        KEEPALIVE_SCRIPT.to_string(),
    ]);

    args
}

/// `exec` arguments that kill in-container processes matching `pattern`
pub fn interrupt_args(container: &str, pattern: &str) -> Vec<String> {
    [
        "exec",
        container,
        "sh",
        "-c",
        KILL_MATCHING_SCRIPT,
        "codebox-interrupt",
        pattern,
    ]
    .map(String::from)
    .to_vec()
}

fn is_missing_container(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no container with name")
}

#[async_trait]
impl HostRuntime for DockerCli {
    fn name(&self) -> &str {
        self.runtime.cmd()
    }

    async fn ping(&self) -> Result<()> {
        let args = ["version".to_string()];
        let output = self.run(&args).await?;
        if !output.is_success() {
            bail!(
                "{} daemon is not reachable: {}",
                self.runtime.cmd(),
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let inspect = ["image", "inspect", image].map(String::from);
        if self.run(&inspect).await?.is_success() {
            debug!("Image {} already present", image);
            return Ok(());
        }

        info!("Pulling image {}...", image);
        let pull = ["pull", image].map(String::from);
        self.run_checked(&pull, &format!("Pulling image {}", image))
            .await?;
        info!("Image {} is ready", image);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self
            .run_checked(&run_args(spec), "Starting container")
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        let args = ["inspect", "-f", "{{.State.Running}}", container].map(String::from);
        let output = self.run(&args).await?;
        Ok(output.is_success() && output.stdout.trim() == "true")
    }

    async fn exec(&self, container: &str, argv: &[String]) -> Result<RawOutput> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            CONTAINER_WORK_DIR.to_string(),
            container.to_string(),
        ];
        args.extend(argv.iter().cloned());
        self.run(&args)
            .await
            .context("Failed to run command in container")
    }

    async fn interrupt(&self, container: &str, pattern: &str) -> Result<()> {
        let output = self.run(&interrupt_args(container, pattern)).await?;
        if !output.is_success() {
            bail!(
                "Failed to interrupt {} in {}: {}",
                pattern,
                container,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn destroy(&self, container: &str, remove: bool) -> Result<()> {
        let args = if remove {
            ["rm", "-f", container].map(String::from).to_vec()
        } else {
            ["stop", "-t", "5", container].map(String::from).to_vec()
        };

        let output = self.run(&args).await?;
        if !output.is_success() {
            if is_missing_container(&output.stderr) {
                debug!("Container {} already gone", container);
                return Ok(());
            }
            bail!(
                "Failed to destroy container {}: {}",
                container,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    fn destroy_blocking(&self, container: &str) {
        let mut cmd = std::process::Command::new(self.runtime.cmd());
        if let Some(ref host) = self.host {
            cmd.env(self.host_env_var(), host);
        }
        let result = cmd
            .args(["rm", "-f", container])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            warn!("Failed to remove container {}: {}", container, e);
        }
    }
}
