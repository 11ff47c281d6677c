use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, KillContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{ClientVersion, Docker};
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

use crate::config::OrchestratorConfig;
use crate::error::RuntimeError;
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, OutputChunk, OutputStream, MANAGED_LABEL,
    SUBMISSION_LABEL,
};

/// Slack on top of the longest deadline before the HTTP client gives up on a
/// streaming call such as `wait`.
const STREAM_TIMEOUT_SLACK: Duration = Duration::from_secs(60);

/// Writable scratch space inside an otherwise read-only container.
const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,size=64m";

/// [`ContainerRuntime`] backed by the Docker Engine API over its Unix socket.
///
/// Containers are created with:
/// - Network disabled (`network_mode = none`)
/// - All capabilities dropped and `no-new-privileges`
/// - Read-only root filesystem with a small tmpfs at `/tmp`
/// - Memory, swap, CPU-share and pids limits
///
/// The underlying client is safe to share between concurrent executions.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    api_timeout: Duration,
    pull_missing_images: bool,
}

impl DockerRuntime {
    /// Build a client for the configured socket and API version.
    ///
    /// No connection is made here; an unreachable daemon surfaces as
    /// [`RuntimeError::Unavailable`] on the first call.
    pub fn connect(config: &OrchestratorConfig) -> Result<Self, RuntimeError> {
        let (major_version, minor_version) = config
            .docker
            .parsed_api_version()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        let version = ClientVersion {
            major_version,
            minor_version,
        };
        let client_timeout = (config.max_timeout + STREAM_TIMEOUT_SLACK).as_secs();

        let docker = Docker::connect_with_unix(&config.docker.socket_path, client_timeout, &version)
            .map_err(|e| {
                RuntimeError::Unavailable(format!(
                    "cannot connect to {}: {}",
                    config.docker.socket_path, e
                ))
            })?;

        tracing::info!(
            socket = %config.docker.socket_path,
            api_version = %config.docker.api_version,
            "Docker client configured"
        );

        Ok(Self {
            docker,
            api_timeout: config.api_timeout,
            pull_missing_images: config.docker.pull_missing_images,
        })
    }

    /// Run a non-streaming daemon call under `api_timeout`.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, BollardError>>,
    ) -> Result<T, BollardError> {
        match tokio::time::timeout(self.api_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout = ?self.api_timeout, "Docker call timed out");
                Err(BollardError::RequestTimeoutError)
            }
        }
    }

    /// Ids of all containers, running or not, matching a `key=value` label filter.
    async fn list_labelled(&self, label: String) -> Result<Vec<ContainerId>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .bounded("list_containers", self.docker.list_containers(Some(options)))
            .await
            .map_err(classify)?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| summary.id)
            .map(ContainerId::new)
            .collect())
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        tracing::info!(image, "Pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut progress = Box::pin(self.docker.create_image(options, None, None));
        while let Some(step) = progress.next().await {
            match step {
                Ok(_) => {}
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(RuntimeError::ImageNotFound(image.to_string())),
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn resolve_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.bounded("inspect_image", self.docker.inspect_image(image)).await {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) if self.pull_missing_images => self.pull(image).await,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::ImageNotFound(image.to_string())),
            Err(e) => Err(classify(e)),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), TMPFS_OPTIONS.to_string());

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            labels: Some(spec.labels.clone()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_bytes),
                cpu_shares: Some(spec.cpu_shares),
                pids_limit: Some(spec.pids_limit),
                readonly_rootfs: Some(spec.readonly_rootfs),
                network_mode: spec.network_disabled.then(|| "none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .bounded(
                "create_container",
                self.docker
                    .create_container::<String, String>(None, config),
            )
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::ImageNotFound(spec.image.clone()),
                other => classify(other),
            })?;

        for warning in &created.warnings {
            tracing::warn!(container_id = %created.id, warning = %warning, "Docker create warning");
        }
        Ok(ContainerId::new(created.id))
    }

    async fn attach(&self, id: &ContainerId, stdin: Vec<u8>) -> Result<OutputStream, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };

        let AttachContainerResults { output, mut input } = self
            .bounded(
                "attach_container",
                self.docker.attach_container(id.as_str(), Some(options)),
            )
            .await
            .map_err(classify)?;

        let container_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = input.write_all(&stdin).await {
                tracing::debug!(container_id = %container_id, error = %e, "Writing stdin failed");
            }
            let _ = input.shutdown().await;
        });

        let chunks = output.filter_map(|item| match item {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                Some(Ok(OutputChunk::Stdout(message.to_vec())))
            }
            Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
            Ok(LogOutput::StdIn { .. }) => None,
            Err(e) => Some(Err(classify(e))),
        });
        Ok(Box::pin(chunks))
    }

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.bounded(
            "start_container",
            self.docker
                .start_container(id.as_str(), None::<StartContainerOptions<String>>),
        )
        .await
        .map_err(classify)
    }

    async fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut responses = Box::pin(self.docker.wait_container(id.as_str(), Some(options)));

        match responses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits are reported as an error by the client
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify(e)),
            None => Err(RuntimeError::OperationFailed(format!(
                "wait on {} ended without a status",
                id
            ))),
        }
    }

    async fn kill(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self
            .bounded(
                "kill_container",
                self.docker.kill_container(id.as_str(), Some(options)),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already exited (409) or already removed (404)
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .bounded(
                "remove_container",
                self.docker.remove_container(id.as_str(), Some(options)),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            }) if message.contains("already in progress") => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ContainerId>, RuntimeError> {
        self.list_labelled(format!("{}=true", MANAGED_LABEL)).await
    }

    async fn list_by_submission(
        &self,
        submission_id: &str,
    ) -> Result<Vec<ContainerId>, RuntimeError> {
        self.list_labelled(format!("{}={}", SUBMISSION_LABEL, submission_id))
            .await
    }
}

/// Map a client error onto the adapter taxonomy. Anything that failed below
/// the HTTP layer means the daemon could not be reached.
fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::OperationFailed(format!("daemon returned {}: {}", status_code, message)),
        BollardError::RequestTimeoutError => {
            RuntimeError::Unavailable("request to Docker daemon timed out".to_string())
        }
        BollardError::IOError { err } => RuntimeError::Unavailable(err.to_string()),
        other if caused_by_io(&other) => RuntimeError::Unavailable(other.to_string()),
        other => RuntimeError::OperationFailed(other.to_string()),
    }
}

fn caused_by_io(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<std::io::Error>() {
            return true;
        }
        current = e.source();
    }
    false
}
