use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::RuntimeError;
use crate::orchestrator::request::{ExecutionRequest, ResolvedLimits};
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, OutputStream, MANAGED_LABEL, SUBMISSION_LABEL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Killed,
    Removed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Killed => write!(f, "killed"),
            ContainerState::Removed => write!(f, "removed"),
        }
    }
}

/// One provisioned container, owned by the supervisor that created it.
///
/// Handles are neither `Clone` nor shared. [`LifecycleManager::teardown`]
/// consumes the handle and removes the container. A handle dropped without
/// teardown (panic, cancelled task) schedules the removal on the current
/// tokio runtime instead, so every container is removed exactly once.
pub struct ExecutionHandle {
    container_id: ContainerId,
    state: ContainerState,
    acquired_at: Instant,
    output: Option<OutputStream>,
    runtime: Arc<dyn ContainerRuntime>,
    torn_down: bool,
}

impl ExecutionHandle {
    fn new(container_id: ContainerId, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            container_id,
            state: ContainerState::Created,
            acquired_at: Instant::now(),
            output: None,
            runtime,
            torn_down: false,
        }
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub(crate) fn set_state(&mut self, state: ContainerState) {
        self.state = state;
    }

    /// Take the attached output stream; `None` once taken.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("container_id", &self.container_id)
            .field("state", &self.state)
            .field("acquired_at", &self.acquired_at)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }

        let container_id = self.container_id.clone();
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    container_id = %container_id,
                    "Execution handle dropped without teardown, removing container in background"
                );
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&container_id).await {
                        tracing::error!(container_id = %container_id, error = %e, "Background container removal failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    container_id = %container_id,
                    "Execution handle dropped outside a tokio runtime, container leaked"
                );
            }
        }
    }
}

/// Creates, starts and removes execution containers.
#[derive(Clone)]
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Resolve the image, create the container, attach its stdio and start it.
    ///
    /// If anything fails after the container may exist, it is removed before
    /// the error is returned. A failed `create` is followed by a lookup on the
    /// submission label, since the daemon can finish a create the client gave
    /// up on.
    pub async fn provision(
        &self,
        request: &ExecutionRequest,
        limits: &ResolvedLimits,
    ) -> Result<ExecutionHandle, RuntimeError> {
        self.runtime.resolve_image(&request.image).await?;

        let spec = container_spec(request, limits);
        let container_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.remove_strays(request).await;
                return Err(e);
            }
        };
        tracing::debug!(
            submission_id = %request.id,
            container_id = %container_id,
            image = %request.image,
            "Container created"
        );

        let mut handle = ExecutionHandle::new(container_id, self.runtime.clone());
        if let Err(e) = self.attach_and_start(&mut handle, request).await {
            tracing::warn!(
                submission_id = %request.id,
                container_id = %handle.container_id,
                error = %e,
                "Container failed to start, removing it"
            );
            self.teardown(handle).await;
            return Err(e);
        }

        Ok(handle)
    }

    async fn attach_and_start(
        &self,
        handle: &mut ExecutionHandle,
        request: &ExecutionRequest,
    ) -> Result<(), RuntimeError> {
        let output = self
            .runtime
            .attach(&handle.container_id, request.source.clone())
            .await?;
        handle.output = Some(output);

        self.runtime.start(&handle.container_id).await?;
        handle.state = ContainerState::Running;
        Ok(())
    }

    /// Remove the container. Failures are logged and swallowed: teardown runs
    /// on paths that already have an outcome and must not replace it.
    pub async fn teardown(&self, mut handle: ExecutionHandle) {
        handle.torn_down = true;
        handle.output = None;

        match self.runtime.remove(&handle.container_id).await {
            Ok(()) => {
                handle.state = ContainerState::Removed;
                tracing::debug!(container_id = %handle.container_id, "Container removed");
            }
            Err(e) => {
                tracing::warn!(
                    container_id = %handle.container_id,
                    state = %handle.state,
                    error = %e,
                    "Failed to remove container"
                );
            }
        }
    }

    /// Best-effort removal of containers the daemon created for `request`
    /// even though `create` reported failure, e.g. after a client timeout.
    async fn remove_strays(&self, request: &ExecutionRequest) {
        let strays = match self
            .runtime
            .list_by_submission(&request.id.to_string())
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::debug!(
                    submission_id = %request.id,
                    error = %e,
                    "Could not look for containers left by a failed create"
                );
                return;
            }
        };

        for id in strays {
            match self.runtime.remove(&id).await {
                Ok(()) => tracing::info!(
                    submission_id = %request.id,
                    container_id = %id,
                    "Removed container left by a failed create"
                ),
                Err(e) => tracing::warn!(
                    submission_id = %request.id,
                    container_id = %id,
                    error = %e,
                    "Failed to remove container left by a failed create"
                ),
            }
        }
    }

    /// Remove every container carrying the ownership label. Returns how many
    /// were removed.
    pub async fn sweep_orphans(&self) -> usize {
        let orphans = match self.runtime.list_managed().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list containers for orphan sweep");
                return 0;
            }
        };

        let mut removed = 0;
        for id in orphans {
            match self.runtime.remove(&id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(container_id = %id, error = %e, "Failed to remove orphaned container")
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed orphaned containers");
        }
        removed
    }
}

fn container_spec(request: &ExecutionRequest, limits: &ResolvedLimits) -> ContainerSpec {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(SUBMISSION_LABEL.to_string(), request.id.to_string());

    ContainerSpec {
        image: request.image.clone(),
        command: request.command.clone(),
        labels,
        memory_bytes: limits.memory_bytes,
        cpu_shares: limits.cpu_shares,
        pids_limit: limits.pids_limit,
        network_disabled: true,
        readonly_rootfs: true,
    }
}
