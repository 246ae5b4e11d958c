//! Sandboxed executor.
//!
//! One executor owns one container for its whole life:
//! `Uninitialized -> Started -> Stopped`. Code blocks are written into a
//! host working directory that is bind-mounted into the container and run
//! there one after another under a wall-clock deadline.
//!
//! Prefer [`SandboxExecutor::with_session`], which pairs `start` and `stop`
//! on every exit path. If an executor is dropped while its container is
//! still up (e.g. the owning future was cancelled), `Drop` force-removes it.

use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::backend::{ContainerSpec, DockerCli, HostRuntime, RawOutput};
use crate::code_block::{self, CodeBlock, Language};
use crate::config::Config;
use crate::error::{ExecutorError, Result};

/// Exit status coreutils `timeout` reports when it killed the command
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Extra time the host waits past the deadline before giving up on the exec
const HOST_GRACE: Duration = Duration::from_secs(3);

/// Seconds between SIGTERM and SIGKILL once a block overruns
const KILL_AFTER_SECS: u64 = 1;

/// Poll interval while waiting for the container to come up
const READY_POLL: Duration = Duration::from_millis(100);

/// Boxed future returned by a [`SandboxExecutor::with_session`] body
pub type SessionFuture<'a, T, E> =
    Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'a>>;

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Started,
    Stopped,
}

#[derive(Debug)]
enum Lifecycle {
    Uninitialized,
    /// Container may exist but is not ready. Tracked so `Drop` can clean it up.
    Starting { container: String },
    Started { container: String },
    Stopped,
}

/// Outcome of one `execute` call
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    exit_code: i32,
    output: String,
    stderr: String,
    timed_out: bool,
    elapsed: Duration,
    limit: Duration,
    code_files: Vec<PathBuf>,
}

impl ExecutionResult {
    fn empty(limit: Duration) -> Self {
        Self {
            exit_code: 0,
            output: String::new(),
            stderr: String::new(),
            timed_out: false,
            elapsed: Duration::ZERO,
            limit,
            code_files: Vec::new(),
        }
    }

    fn push(&mut self, raw: RawOutput) {
        self.exit_code = raw.exit_code;
        self.output.push_str(&raw.stdout);
        self.output.push_str(&raw.stderr);
        self.stderr.push_str(&raw.stderr);
    }

    fn fail(&mut self, message: String) {
        self.exit_code = 1;
        self.output.push_str(&message);
        self.stderr.push_str(&message);
    }

    fn mark_timed_out(&mut self) {
        self.exit_code = TIMEOUT_EXIT_CODE;
        self.timed_out = true;
    }

    /// Exit code of the last block that ran
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Combined stdout and stderr of every block that ran
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Wall-clock time of the whole call
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Host paths the blocks were written to
    pub fn code_files(&self) -> &[PathBuf] {
        &self.code_files
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Turn a timeout or non-zero exit into an error.
    pub fn check(&self) -> Result<&Self> {
        if self.timed_out {
            return Err(ExecutorError::Timeout {
                elapsed: self.elapsed,
                limit: self.limit,
            });
        }
        if self.exit_code != 0 {
            return Err(ExecutorError::Execution {
                exit_code: self.exit_code,
                stderr: self.stderr.clone(),
            });
        }
        Ok(self)
    }
}

/// Runs untrusted code blocks inside an isolated, single-tenant container
pub struct SandboxExecutor {
    runtime: Arc<dyn HostRuntime>,
    config: Config,
    container_name: String,
    host_work_dir: Option<PathBuf>,
    audit: Option<AuditLog>,
    state: Lifecycle,
}

impl SandboxExecutor {
    /// Create an executor for the given runtime. Nothing is provisioned
    /// until [`start`](Self::start).
    pub fn new(config: Config, runtime: Arc<dyn HostRuntime>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ExecutorError::Config(format!("{:#}", e)))?;

        let container_name = config.executor.container_name.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("codebox-{}", &id[..12])
        });
        let audit = AuditLog::from_config(&config.audit);

        Ok(Self {
            runtime,
            config,
            container_name,
            host_work_dir: None,
            audit,
            state: Lifecycle::Uninitialized,
        })
    }

    /// Executor backed by the Docker/Podman CLI named in the config
    pub fn from_config(config: Config) -> Result<Self> {
        let runtime = Arc::new(DockerCli::from_config(&config.runtime));
        Self::new(config, runtime)
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            Lifecycle::Uninitialized | Lifecycle::Starting { .. } => SessionState::Uninitialized,
            Lifecycle::Started { .. } => SessionState::Started,
            Lifecycle::Stopped => SessionState::Stopped,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Host working directory (absolute once started)
    pub fn work_dir(&self) -> &Path {
        self.host_work_dir
            .as_deref()
            .unwrap_or(self.config.executor.work_dir.as_path())
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    fn record(&self, event: AuditEvent) {
        if let Some(ref audit) = self.audit {
            audit.record(event);
        }
    }

    /// Provision the container.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Uninitialized => {}
            Lifecycle::Starting { .. } | Lifecycle::Started { .. } => {
                return Err(ExecutorError::AlreadyStarted(self.container_name.clone()));
            }
            Lifecycle::Stopped => return Err(ExecutorError::Stopped),
        }

        let configured = &self.config.executor.work_dir;
        tokio::fs::create_dir_all(configured).await?;
        let work_dir = tokio::fs::canonicalize(configured).await?;
        self.host_work_dir = Some(work_dir.clone());

        match self.provision(work_dir).await {
            Ok(()) => {
                self.state = Lifecycle::Started {
                    container: self.container_name.clone(),
                };
                info!(
                    "Sandbox {} started from {} ({})",
                    self.container_name,
                    self.config.executor.image,
                    self.runtime.name()
                );
                self.record(AuditEvent::SessionStarted {
                    container: self.container_name.clone(),
                    image: self.config.executor.image.clone(),
                    runtime: self.runtime.name().to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.record(AuditEvent::ProvisioningFailed {
                    image: self.config.executor.image.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn provision(&mut self, work_dir: PathBuf) -> Result<()> {
        let startup_timeout = self.config.startup_timeout();
        let deadline = Instant::now() + startup_timeout;
        let runtime = Arc::clone(&self.runtime);

        match tokio::time::timeout(startup_timeout, runtime.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ExecutorError::provisioning(e)),
            Err(_) => {
                return Err(ExecutorError::Provisioning(format!(
                    "{} did not respond within {:?}",
                    runtime.name(),
                    startup_timeout
                )));
            }
        }

        runtime
            .ensure_image(&self.config.executor.image)
            .await
            .map_err(ExecutorError::provisioning)?;

        let spec = ContainerSpec {
            name: self.container_name.clone(),
            image: self.config.executor.image.clone(),
            host_work_dir: work_dir,
            auto_remove: self.config.executor.auto_remove,
            network: self.config.resources.network,
            memory_mb: self.config.resources.memory_mb,
            cpus: self.config.resources.cpus,
            env: self
                .config
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        // Tracked before `create` so Drop removes it if cancelled mid-create
        self.state = Lifecycle::Starting {
            container: self.container_name.clone(),
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let id = match tokio::time::timeout(remaining, runtime.create(&spec)).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                self.abort_start().await;
                return Err(ExecutorError::provisioning(e));
            }
            Err(_) => {
                self.abort_start().await;
                return Err(ExecutorError::Provisioning(format!(
                    "creating container {} did not finish within {:?}",
                    self.container_name, startup_timeout
                )));
            }
        };
        debug!("Created container {} ({})", self.container_name, id);

        if let Err(e) = self.wait_until_ready(deadline).await {
            self.abort_start().await;
            return Err(e);
        }

        if let Some(init) = self.config.executor.init_command.clone() {
            let argv = vec!["sh".to_string(), "-c".to_string(), init];
            let remaining = deadline.saturating_duration_since(Instant::now());
            let failure = match tokio::time::timeout(
                remaining,
                runtime.exec(&self.container_name, &argv),
            )
            .await
            {
                Ok(Ok(raw)) if raw.is_success() => None,
                Ok(Ok(raw)) => Some(format!(
                    "init_command exited with {}: {}",
                    raw.exit_code,
                    raw.stderr.trim()
                )),
                Ok(Err(e)) => Some(format!("init_command failed: {:#}", e)),
                Err(_) => Some(format!(
                    "init_command did not finish within {:?}",
                    startup_timeout
                )),
            };
            if let Some(message) = failure {
                self.abort_start().await;
                return Err(ExecutorError::Provisioning(message));
            }
        }

        Ok(())
    }

    async fn wait_until_ready(&self, deadline: Instant) -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.runtime.is_running(&self.container_name))
                .await
            {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) | Err(_) => {}
                Ok(Err(e)) => debug!("Readiness check failed: {:#}", e),
            }
            if Instant::now() >= deadline {
                return Err(ExecutorError::Provisioning(format!(
                    "container {} did not become ready within {:?}",
                    self.container_name,
                    self.config.startup_timeout()
                )));
            }
            tokio::time::sleep(READY_POLL.min(remaining)).await;
        }
    }

    /// Remove a half-provisioned container and fall back to `Uninitialized`
    async fn abort_start(&mut self) {
        if let Err(e) = self.runtime.destroy(&self.container_name, true).await {
            warn!(
                "Failed to clean up container {} after failed start: {:#}",
                self.container_name, e
            );
        }
        self.state = Lifecycle::Uninitialized;
    }

    fn running_container(&self) -> Result<String> {
        match &self.state {
            Lifecycle::Started { container } => Ok(container.clone()),
            Lifecycle::Uninitialized | Lifecycle::Starting { .. } => Err(ExecutorError::NotStarted),
            Lifecycle::Stopped => Err(ExecutorError::Stopped),
        }
    }

    /// Run code blocks in order, stopping after the first failure.
    ///
    /// Non-zero exits and timeouts are reported in the result. Errors are
    /// reserved for lifecycle misuse, host filesystem failures and the
    /// runtime itself breaking.
    pub async fn execute(&mut self, blocks: &[CodeBlock]) -> Result<ExecutionResult> {
        let container = self.running_container()?;
        let work_dir = self
            .host_work_dir
            .clone()
            .ok_or(ExecutorError::NotStarted)?;

        let limit = self.timeout();
        let started = Instant::now();
        let mut result = ExecutionResult::empty(limit);

        let outcome = self
            .run_blocks(&container, &work_dir, blocks, started + limit, &mut result)
            .await;
        result.elapsed = started.elapsed();

        if self.config.executor.delete_tmp_files {
            for file in &result.code_files {
                if let Err(e) = tokio::fs::remove_file(file).await {
                    debug!("Failed to delete {}: {}", file.display(), e);
                }
            }
        }
        outcome?;

        if result.timed_out {
            warn!(
                "Execution in {} timed out after {:?}",
                container, result.elapsed
            );
        }
        self.record(AuditEvent::CodeExecuted {
            container,
            languages: blocks.iter().map(|b| b.language.clone()).collect(),
            code_files: result
                .code_files
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            elapsed_ms: result.elapsed.as_millis() as u64,
        });

        Ok(result)
    }

    async fn run_blocks(
        &self,
        container: &str,
        work_dir: &Path,
        blocks: &[CodeBlock],
        deadline: Instant,
        result: &mut ExecutionResult,
    ) -> Result<()> {
        for block in blocks {
            let Some(language) = Language::from_tag(&block.language) else {
                result.fail(format!("Unsupported language {}\n", block.language));
                break;
            };

            let code = if self.config.executor.silence_pip {
                code_block::silence_pip(&block.code, language)
            } else {
                block.code.clone()
            };

            let directive = code_block::filename_directive(&code);
            let relative = match directive {
                Some(name) => match code_block::validate_relative_path(name) {
                    Ok(path) => path,
                    Err(e) => {
                        result.fail(format!("{}\n", e));
                        break;
                    }
                },
                None => PathBuf::from(code_block::generated_filename(&code, language)),
            };

            let host_path = work_dir.join(&relative);
            if let Err(e) = write_code(&host_path, &code).await {
                // A requested name can collide with a directory or file
                if directive.is_some() {
                    result.fail(format!("Cannot write {}: {}\n", relative.display(), e));
                    break;
                }
                return Err(e.into());
            }
            result.code_files.push(host_path);

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                result.mark_timed_out();
                break;
            }

            // The container path mirrors the host path under the mount
            let script = relative.to_string_lossy().replace('\\', "/");
            let secs = remaining.as_secs_f64().ceil().max(1.0) as u64;
            let argv = vec![
                "timeout".to_string(),
                "-k".to_string(),
                KILL_AFTER_SECS.to_string(),
                secs.to_string(),
                language.command().to_string(),
                script.clone(),
            ];
            debug!("Running {} block {} in {}", language, script, container);

            match tokio::time::timeout(remaining + HOST_GRACE, self.runtime.exec(container, &argv))
                .await
            {
                Ok(Ok(raw)) => {
                    let exit_code = raw.exit_code;
                    result.push(raw);
                    // `timeout -k` escalates to SIGKILL on its whole process
                    // group, itself included, so that case surfaces as 137
                    let overran = exit_code != 0 && Instant::now() >= deadline;
                    if exit_code == TIMEOUT_EXIT_CODE || overran {
                        result.mark_timed_out();
                        break;
                    }
                    if exit_code != 0 {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    return Err(ExecutorError::Runtime(format!("{:#}", e)));
                }
                Err(_) => {
                    result.mark_timed_out();
                    if let Err(e) = self.runtime.interrupt(container, &script).await {
                        warn!("Failed to interrupt {} in {}: {:#}", script, container, e);
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Tear down the container. No-op if never started; idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        let container = match std::mem::replace(&mut self.state, Lifecycle::Stopped) {
            Lifecycle::Started { container } | Lifecycle::Starting { container } => container,
            Lifecycle::Uninitialized | Lifecycle::Stopped => return Ok(()),
        };

        let outcome = self
            .runtime
            .destroy(&container, self.config.executor.auto_remove)
            .await;

        if self.config.executor.remove_work_dir_on_stop
            && let Some(ref dir) = self.host_work_dir
            && let Err(e) = tokio::fs::remove_dir_all(dir).await
        {
            warn!("Failed to remove working directory {}: {}", dir.display(), e);
        }

        self.record(AuditEvent::SessionStopped {
            container: container.clone(),
            error: outcome.as_ref().err().map(|e| format!("{:#}", e)),
        });

        match outcome {
            Ok(()) => {
                info!("Sandbox {} stopped", container);
                Ok(())
            }
            Err(e) => Err(ExecutorError::teardown(e)),
        }
    }

    /// Replace the running container with a fresh one on the same working
    /// directory. Use after a timeout left the old one in an unknown state.
    pub async fn restart(&mut self) -> Result<()> {
        let container = self.running_container()?;
        let outcome = self.runtime.destroy(&container, true).await;
        self.record(AuditEvent::SessionStopped {
            container: container.clone(),
            error: outcome.as_ref().err().map(|e| format!("{:#}", e)),
        });
        outcome.map_err(ExecutorError::teardown)?;
        self.state = Lifecycle::Uninitialized;
        info!("Restarting sandbox {}", container);
        self.start().await
    }

    /// Start, run `body`, and stop on every exit path.
    ///
    /// A teardown failure is logged and never replaces the body's result.
    ///
    /// ```no_run
    /// # use codebox::{CodeBlock, Config, SandboxExecutor, ExecutorError};
    /// # async fn demo() -> Result<(), ExecutorError> {
    /// let executor = SandboxExecutor::from_config(Config::default())?;
    /// let output = executor
    ///     .with_session(|sb| {
    ///         Box::pin(async move {
    ///             let result = sb.execute(&[CodeBlock::python("print('hi')")]).await?;
    ///             Ok::<_, ExecutorError>(result.output().to_string())
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_session<T, E, F>(mut self, body: F) -> std::result::Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut SandboxExecutor) -> SessionFuture<'a, T, E>,
        E: From<ExecutorError>,
    {
        if let Err(e) = self.start().await {
            let _ = self.stop().await;
            return Err(e.into());
        }

        let result = body(&mut self).await;

        if let Err(e) = self.stop().await {
            warn!("Sandbox {} teardown failed: {}", self.container_name, e);
        }
        result
    }
}

async fn write_code(path: &Path, code: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, code).await
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        if let Lifecycle::Started { container } | Lifecycle::Starting { container } = &self.state {
            warn!("Sandbox {} dropped while running, removing container", container);
            self.runtime.destroy_blocking(container);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(exit_code: i32, stdout: &str, stderr: &str) -> RawOutput {
        RawOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_result_accumulates_in_order() {
        let mut result = ExecutionResult::empty(Duration::from_secs(5));
        assert!(result.success());

        result.push(raw(0, "one\n", ""));
        result.push(raw(2, "two\n", "boom\n"));
        assert_eq!(result.output(), "one\ntwo\nboom\n");
        assert_eq!(result.stderr(), "boom\n");
        assert_eq!(result.exit_code(), 2);
        assert!(!result.success());
    }

    #[test]
    fn test_check_maps_failures() {
        let mut failed = ExecutionResult::empty(Duration::from_secs(5));
        failed.push(raw(1, "", "Traceback\n"));
        match failed.check() {
            Err(ExecutorError::Execution { exit_code, stderr }) => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "Traceback\n");
            }
            other => panic!("expected execution error, got {:?}", other),
        }

        let mut timed_out = ExecutionResult::empty(Duration::from_secs(5));
        timed_out.elapsed = Duration::from_secs(6);
        timed_out.mark_timed_out();
        assert!(matches!(
            timed_out.check(),
            Err(ExecutorError::Timeout { limit, .. }) if limit == Duration::from_secs(5)
        ));

        let ok = ExecutionResult::empty(Duration::from_secs(5));
        assert!(ok.check().is_ok());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = Config::default();
        config.executor.timeout_secs = 0;
        let runtime = Arc::new(DockerCli::from_config(&config.runtime));
        assert!(matches!(
            SandboxExecutor::new(config, runtime),
            Err(ExecutorError::Config(_))
        ));
    }

    #[test]
    fn test_generated_container_name() {
        let executor = SandboxExecutor::from_config(Config::default()).unwrap();
        assert!(executor.container_name().starts_with("codebox-"));
        assert_eq!(executor.state(), SessionState::Uninitialized);
        assert!(crate::validation::validate_container_name(executor.container_name()).is_ok());
    }
}
