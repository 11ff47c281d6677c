use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::ExecError;

/// Per-request overrides of the configured sandbox limits.
///
/// Unset fields fall back to [`OrchestratorConfig`] when the request is
/// resolved; the timeout is additionally clamped to `max_timeout`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_shares: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub pids_limit: Option<i64>,
    pub timeout: Option<Duration>,
}

/// Limits actually applied to one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub cpu_shares: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub timeout: Duration,
}

impl ResourceLimits {
    pub fn resolve(&self, config: &OrchestratorConfig) -> ResolvedLimits {
        ResolvedLimits {
            cpu_shares: self.cpu_shares.unwrap_or(config.limits.cpu_shares),
            memory_bytes: self.memory_bytes.unwrap_or(config.limits.memory_bytes),
            pids_limit: self.pids_limit.unwrap_or(config.limits.pids_limit),
            timeout: self.timeout.unwrap_or(config.timeout).min(config.max_timeout),
        }
    }
}

/// One code submission. Built once at the facade and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub id: Uuid,
    /// Program text, fed to the container on stdin
    pub source: Vec<u8>,
    /// Image reference; opaque to the orchestrator
    pub image: String,
    /// Command override; `None` runs the image's default command
    pub command: Option<Vec<String>>,
    pub limits: ResourceLimits,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(image: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            image: image.into(),
            command: None,
            limits: ResourceLimits::default(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = Some(timeout);
        self
    }

    /// Check the request against the configured bounds before admission.
    pub fn validate(&self, config: &OrchestratorConfig) -> Result<(), ExecError> {
        if self.image.trim().is_empty() {
            return Err(ExecError::InvalidRequest("image must not be empty".to_string()));
        }
        if self.source.len() > config.max_source_bytes {
            return Err(ExecError::InvalidRequest(format!(
                "source is {} bytes, limit is {}",
                self.source.len(),
                config.max_source_bytes
            )));
        }
        if matches!(&self.command, Some(cmd) if cmd.is_empty()) {
            return Err(ExecError::InvalidRequest("command must not be empty".to_string()));
        }
        if self.limits.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ExecError::InvalidRequest("timeout must be greater than zero".to_string()));
        }
        for (name, value) in [
            ("cpu_shares", self.limits.cpu_shares),
            ("memory_bytes", self.limits.memory_bytes),
            ("pids_limit", self.limits.pids_limit),
        ] {
            if value.is_some_and(|v| v <= 0) {
                return Err(ExecError::InvalidRequest(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
