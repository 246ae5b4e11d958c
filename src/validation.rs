//! Input validation for values interpolated into container runtime commands.
//!
//! Everything passed as an argument to the runtime CLI that comes from
//! configuration or the command line goes through here first.

use anyhow::{Result, bail};

/// Docker's own limit is 128 but keep names short enough to read in `docker ps`.
const MAX_CONTAINER_NAME_LEN: usize = 63;

/// Maximum length for image references
const MAX_IMAGE_LEN: usize = 256;

/// Schemes understood by `DOCKER_HOST`
const DOCKER_HOST_SCHEMES: &[&str] = &["unix://", "tcp://", "npipe://", "ssh://"];

/// Validate a container name.
///
/// Valid names start and end with a letter or digit and contain only
/// letters, digits, hyphens, underscores and periods.
pub fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Container name cannot be empty");
    }

    if name.len() > MAX_CONTAINER_NAME_LEN {
        bail!(
            "Container name too long (max {} characters)",
            MAX_CONTAINER_NAME_LEN
        );
    }

    let first = name.chars().next().unwrap_or('-');
    let last = name.chars().last().unwrap_or('-');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        bail!("Container name must start and end with a letter or number");
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_' && ch != '.' {
            bail!(
                "Container name contains invalid character '{}'. Only letters, numbers, hyphens, underscores, and periods are allowed",
                ch
            );
        }
    }

    Ok(())
}

/// Validate a Docker image reference.
pub fn validate_docker_image(image: &str) -> Result<()> {
    if image.is_empty() {
        bail!("Docker image name cannot be empty");
    }

    if image.len() > MAX_IMAGE_LEN {
        bail!("Docker image name too long (max {} characters)", MAX_IMAGE_LEN);
    }

    if image.starts_with('-') {
        bail!("Docker image name cannot start with '-'");
    }

    // Registry host, namespace, tag and digest separators
    for ch in image.chars() {
        if !ch.is_ascii_alphanumeric() && !matches!(ch, '.' | '-' | '_' | '/' | ':' | '@') {
            bail!(
                "Docker image name contains invalid character '{}'. Use only alphanumeric characters, periods, hyphens, underscores, slashes, colons, and @",
                ch
            );
        }
    }

    Ok(())
}

/// Validate an explicit runtime endpoint such as `unix:///var/run/docker.sock`.
pub fn validate_docker_host(host: &str) -> Result<()> {
    if host.trim().is_empty() {
        bail!("docker_host cannot be empty; omit it to use the runtime's default");
    }

    if !DOCKER_HOST_SCHEMES.iter().any(|s| host.starts_with(s)) {
        bail!(
            "Unsupported docker_host '{}'. Expected one of: {}",
            host,
            DOCKER_HOST_SCHEMES.join(", ")
        );
    }

    if host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("docker_host cannot contain whitespace or control characters");
    }

    Ok(())
}

/// Validate an environment variable name passed with `-e`.
pub fn validate_env_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("Environment variable name cannot be empty");
    }
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        bail!("Environment variable '{}' cannot start with a digit", key);
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("Environment variable '{}' contains invalid characters", key);
    }
    Ok(())
}
