//! Container runtime client adapter.
//!
//! The orchestrator talks to the container daemon only through the
//! [`ContainerRuntime`] trait, so the daemon connection is an injected value
//! rather than a global. Production code uses [`DockerRuntime`]; tests plug in
//! an in-memory runtime.
//!
//! # Contract
//!
//! - [`ContainerRuntime::kill`] on an exited or missing container succeeds.
//! - [`ContainerRuntime::remove`] is a force-remove and tolerates "already gone".
//! - Implementations never retry; retry policy belongs to the caller.

pub mod docker;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::RuntimeError;

pub use docker::DockerRuntime;

/// Label placed on every container the orchestrator creates.
pub const MANAGED_LABEL: &str = "onlycode.managed";
/// Label carrying the submission id a container belongs to.
pub const SUBMISSION_LABEL: &str = "onlycode.submission";

/// Opaque identifier assigned by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the runtime needs to create one execution container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// Command override; `None` runs the image's default command
    pub command: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
    pub network_disabled: bool,
    pub readonly_rootfs: bool,
}

/// A piece of output read from the container's stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Output of an attached container; ends when the container's stdio closes.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, RuntimeError>> + Send>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is available locally.
    async fn resolve_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a stopped container.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    /// Attach to the container's stdio before it starts. `stdin` is written to
    /// the program and then closed.
    async fn attach(&self, id: &ContainerId, stdin: Vec<u8>) -> Result<OutputStream, RuntimeError>;

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Block until the container's main process exits and return its exit code.
    async fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError>;

    /// Send SIGKILL.
    async fn kill(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Force-remove the container.
    async fn remove(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Containers carrying [`MANAGED_LABEL`], running or not.
    async fn list_managed(&self) -> Result<Vec<ContainerId>, RuntimeError>;

    /// Containers whose [`SUBMISSION_LABEL`] is `submission_id`, running or not.
    async fn list_by_submission(
        &self,
        submission_id: &str,
    ) -> Result<Vec<ContainerId>, RuntimeError>;
}
