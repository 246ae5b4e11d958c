use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use codebox::audit::{AuditLog, default_audit_path};
use codebox::backend::{DockerCli, HostRuntime};
use codebox::config::{Config, RuntimeKind};
use codebox::validation;
use codebox::{CodeBlock, ExecutorError, Language, SandboxExecutor};

const DEFAULT_CONFIG: &str = "codebox.toml";

#[derive(Parser)]
#[command(name = "codebox")]
#[command(about = "Run untrusted generated code in isolated, time-bounded containers")]
#[command(version)]
struct Cli {
    /// Path to codebox.toml (default: ./codebox.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Runtime endpoint, e.g. unix:///var/run/docker.sock
    #[arg(long, global = true)]
    docker_host: Option<String>,

    /// Container runtime CLI: docker, podman
    #[arg(long, global = true)]
    runtime: Option<RuntimeKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run code in a fresh sandbox (start, execute, stop)
    Run {
        /// File to run (language inferred from its extension)
        file: Option<PathBuf>,
        /// Inline code instead of a file; reads stdin when neither is given
        #[arg(short = 'e', long, conflicts_with = "file")]
        code: Option<String>,
        /// Language tag: python, sh, pwsh
        #[arg(short, long)]
        lang: Option<String>,
        /// Image to run in (overrides config)
        #[arg(short, long)]
        image: Option<String>,
        /// Host working directory mounted into the container
        #[arg(short, long)]
        work_dir: Option<PathBuf>,
        /// Wall-clock limit in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Disable network access
        #[arg(long)]
        no_network: bool,
        /// Stop the container instead of removing it
        #[arg(long)]
        keep: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that the container runtime is reachable
    Status,
    /// Write a starter codebox.toml in the current directory
    Init,
    /// Show recent audit log entries
    Audit {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        last: usize,
        /// Only entries for this container
        #[arg(long)]
        container: Option<String>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("codebox=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load --config, else ./codebox.toml, else defaults; then apply global flags.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else if Path::new(DEFAULT_CONFIG).exists() {
        Config::from_file(Path::new(DEFAULT_CONFIG))?
    } else {
        Config::default()
    };

    if let Some(ref host) = cli.docker_host {
        validation::validate_docker_host(host)?;
        config.runtime.docker_host = Some(host.clone());
    }
    if let Some(kind) = cli.runtime {
        config.runtime.kind = kind;
    }
    Ok(config)
}

async fn read_source(file: Option<&Path>, code: Option<String>) -> Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    if let Some(path) = file {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let mut buf = String::new();
    tokio::io::stdin()
        .read_to_string(&mut buf)
        .await
        .context("Failed to read code from stdin")?;
    Ok(buf)
}

fn resolve_language(lang: Option<String>, file: Option<&Path>) -> String {
    if let Some(lang) = lang {
        return lang;
    }
    let from_ext = file
        .and_then(|p| p.extension())
        .and_then(|e| Language::from_tag(&e.to_string_lossy()));
    from_ext.unwrap_or(Language::Python).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            file,
            code,
            lang,
            image,
            work_dir,
            timeout,
            no_network,
            keep,
            json,
        } => {
            if let Some(image) = image {
                config.executor.image = image;
            }
            if let Some(dir) = work_dir {
                config.executor.work_dir = dir;
            }
            if let Some(secs) = timeout {
                config.executor.timeout_secs = secs;
            }
            if no_network {
                config.resources.network = false;
            }
            if keep {
                config.executor.auto_remove = false;
            }

            let language = resolve_language(lang, file.as_deref());
            let source = read_source(file.as_deref(), code).await?;
            if source.trim().is_empty() {
                bail!("No code to run. Pass a file, --code, or pipe code on stdin");
            }
            let blocks = vec![CodeBlock::new(language, source)];

            let executor = SandboxExecutor::from_config(config)?;
            let result = executor
                .with_session(|sb| {
                    Box::pin(async move { Ok::<_, ExecutorError>(sb.execute(&blocks).await?) })
                })
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", result.output());
                if result.timed_out() {
                    eprintln!("Timed out after {:?}", result.elapsed());
                }
            }

            if !result.success() {
                std::process::exit(result.exit_code());
            }
        }
        Commands::Status => {
            let runtime = DockerCli::from_config(&config.runtime);
            let endpoint = config
                .runtime
                .docker_host
                .as_deref()
                .unwrap_or("(runtime default)");
            match tokio::time::timeout(config.startup_timeout(), runtime.ping()).await {
                Ok(Ok(())) => println!("{} is reachable at {}", runtime.name(), endpoint),
                Ok(Err(e)) => bail!("{:#}", e),
                Err(_) => bail!(
                    "{} at {} did not respond within {:?}",
                    runtime.name(),
                    endpoint,
                    config.startup_timeout()
                ),
            }
        }
        Commands::Init => {
            let path = Path::new(DEFAULT_CONFIG);
            if path.exists() {
                bail!("{} already exists in this directory", DEFAULT_CONFIG);
            }
            std::fs::write(path, Config::starter_toml())?;
            println!("Created {}", DEFAULT_CONFIG);
        }
        Commands::Audit { last, container } => {
            let log = AuditLog::from_config(&config.audit)
                .unwrap_or_else(|| AuditLog::with_path(default_audit_path()));
            let entries = match container {
                Some(name) => log.read_by_container(&name)?,
                None => log.read_last(last)?,
            };
            if entries.is_empty() {
                println!("No audit entries in {}", log.path().display());
            }
            for entry in entries {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }

    Ok(())
}
