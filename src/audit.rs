//! Audit trail of sandbox sessions.
//!
//! Appends one JSON object per line for every session start, code
//! execution and teardown. Default location: ~/.codebox/audit.jsonl

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::AuditConfig;

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStarted {
        container: String,
        image: String,
        runtime: String,
    },
    ProvisioningFailed {
        image: String,
        error: String,
    },
    CodeExecuted {
        container: String,
        languages: Vec<String>,
        code_files: Vec<String>,
        exit_code: i32,
        timed_out: bool,
        elapsed_ms: u64,
    },
    SessionStopped {
        container: String,
        error: Option<String>,
    },
}

impl AuditEvent {
    /// Container the event refers to, if any
    pub fn container(&self) -> Option<&str> {
        match self {
            AuditEvent::SessionStarted { container, .. }
            | AuditEvent::CodeExecuted { container, .. }
            | AuditEvent::SessionStopped { container, .. } => Some(container),
            AuditEvent::ProvisioningFailed { .. } => None,
        }
    }
}

/// A logged audit entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    /// Username (from environment)
    pub user: Option<String>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            pid: std::process::id(),
            user: std::env::var("USER").ok(),
            event,
        }
    }
}

/// Get the default audit log path
pub fn default_audit_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codebox")
        .join("audit.jsonl")
}

/// Append-only JSONL audit log
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Build from config; None when auditing is disabled.
    pub fn from_config(config: &AuditConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let path = config.path.clone().unwrap_or_else(default_audit_path);
        Some(Self::with_path(path))
    }

    pub fn log(&self, event: AuditEvent) -> Result<()> {
        let entry = AuditEntry::new(event);
        let line = serde_json::to_string(&entry)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Log an event, downgrading write failures to a warning
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(event) {
            warn!("Failed to write audit log {}: {}", self.path.display(), e);
        }
    }

    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping malformed audit entry: {}", e),
            }
        }

        Ok(entries)
    }

    pub fn read_by_container(&self, container: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.event.container() == Some(container))
            .collect())
    }

    /// Read the last N entries
    pub fn read_last(&self, n: usize) -> Result<Vec<AuditEntry>> {
        let entries = self.read_all()?;
        let start = entries.len().saturating_sub(n);
        Ok(entries[start..].to_vec())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_audit_entry_serialization() {
        let entry = AuditEntry::new(AuditEvent::SessionStarted {
            container: "codebox-1".to_string(),
            image: "python:3-slim".to_string(),
            runtime: "docker".to_string(),
        });

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"session_started\""));
        assert!(json.contains("\"container\":\"codebox-1\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_disabled_config_gives_no_log() {
        assert!(AuditLog::from_config(&AuditConfig::default()).is_none());

        let config = AuditConfig {
            enabled: true,
            path: Some(PathBuf::from("/tmp/x.jsonl")),
        };
        let log = AuditLog::from_config(&config).unwrap();
        assert_eq!(log.path(), Path::new("/tmp/x.jsonl"));
    }

    #[test]
    fn test_write_read_and_filter() {
        let dir = tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("nested").join("audit.jsonl"));

        log.log(AuditEvent::SessionStarted {
            container: "a".to_string(),
            image: "python:3-slim".to_string(),
            runtime: "docker".to_string(),
        })
        .unwrap();
        log.log(AuditEvent::CodeExecuted {
            container: "a".to_string(),
            languages: vec!["python".to_string()],
            code_files: vec!["tmp_code_x.py".to_string()],
            exit_code: 0,
            timed_out: false,
            elapsed_ms: 12,
        })
        .unwrap();
        log.log(AuditEvent::ProvisioningFailed {
            image: "python:3-slim".to_string(),
            error: "daemon down".to_string(),
        })
        .unwrap();
        log.log(AuditEvent::SessionStopped {
            container: "b".to_string(),
            error: None,
        })
        .unwrap();

        assert_eq!(log.read_all().unwrap().len(), 4);
        assert_eq!(log.read_by_container("a").unwrap().len(), 2);
        let last = log.read_last(1).unwrap();
        assert!(matches!(
            last[0].event,
            AuditEvent::SessionStopped { ref container, .. } if container == "b"
        ));
    }
}
