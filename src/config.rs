use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_conn must be at least 1")]
    ZeroCapacity,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("default timeout {timeout:?} exceeds max timeout {max:?}")]
    TimeoutAboveMax { timeout: Duration, max: Duration },

    #[error("output_limit_bytes must be greater than zero")]
    ZeroOutputLimit,

    #[error("invalid Docker API version {0:?}, expected <major>.<minor>")]
    InvalidApiVersion(String),
}

/// Resource ceilings applied to every execution container.
///
/// Requests may override individual values; anything left unset falls back
/// to these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Memory ceiling in bytes (swap is pinned to the same value)
    pub memory_bytes: i64,
    /// Relative CPU weight
    pub cpu_shares: i64,
    /// Maximum number of processes inside the container
    pub pids_limit: i64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_shares: 512,
            pids_limit: 64,
        }
    }
}

/// Docker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerConfig {
    /// Path of the daemon's Unix socket
    pub socket_path: String,
    /// API version negotiated with the daemon, e.g. "1.41"
    pub api_version: String,
    /// Pull images that are not present locally instead of failing
    pub pull_missing_images: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/docker.sock".to_string(),
            api_version: "1.41".to_string(),
            pull_missing_images: false,
        }
    }
}

impl DockerConfig {
    /// Split the configured API version into `(major, minor)`.
    pub fn parsed_api_version(&self) -> Result<(usize, usize), ConfigError> {
        let invalid = || ConfigError::InvalidApiVersion(self.api_version.clone());
        let (major, minor) = self.api_version.split_once('.').ok_or_else(invalid)?;
        let major = major.trim().parse().map_err(|_| invalid())?;
        let minor = minor.trim().parse().map_err(|_| invalid())?;
        Ok((major, minor))
    }
}

/// Configuration for the execution orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Port the HTTP transport binds to
    pub http_port: u16,
    pub docker: DockerConfig,
    /// Wall-clock deadline applied when a request does not carry its own
    pub timeout: Duration,
    /// Upper bound for per-request deadlines
    pub max_timeout: Duration,
    /// Number of executions allowed to run at once
    pub max_conn: usize,
    /// How long a submission may queue for a free slot before it is rejected
    pub admission_timeout: Duration,
    /// Bound on non-streaming daemon calls
    pub api_timeout: Duration,
    /// How long to keep reading output after the container exits or is killed
    pub drain_grace: Duration,
    /// Largest accepted source payload
    pub max_source_bytes: usize,
    /// Per-stream ceiling for captured stdout/stderr
    pub output_limit_bytes: usize,
    pub limits: SandboxLimits,
    /// Directory served under /static
    pub static_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            docker: DockerConfig::default(),
            timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
            max_conn: 4,
            admission_timeout: Duration::from_secs(30),
            api_timeout: Duration::from_secs(5),
            drain_grace: Duration::from_secs(1),
            max_source_bytes: 64 * 1024,
            output_limit_bytes: 64 * 1024,
            limits: SandboxLimits::default(),
            static_dir: PathBuf::from("static"),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_conn(mut self, max_conn: usize) -> Self {
        self.max_conn = max_conn;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// Reject configurations the orchestrator cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_conn == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        for (name, value) in [
            ("timeout", self.timeout),
            ("max_timeout", self.max_timeout),
            ("api_timeout", self.api_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.timeout > self.max_timeout {
            return Err(ConfigError::TimeoutAboveMax {
                timeout: self.timeout,
                max: self.max_timeout,
            });
        }
        if self.output_limit_bytes == 0 {
            return Err(ConfigError::ZeroOutputLimit);
        }
        self.docker.parsed_api_version()?;
        Ok(())
    }
}
