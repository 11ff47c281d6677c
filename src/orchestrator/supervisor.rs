use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{ExecError, RuntimeError};
use crate::orchestrator::admission::AdmissionController;
use crate::orchestrator::lifecycle::{ContainerState, ExecutionHandle, LifecycleManager};
use crate::orchestrator::output::ResultAggregator;
use crate::orchestrator::request::ExecutionRequest;
use crate::orchestrator::result::{ExecutionResult, ExecutionStatus};
use crate::runtime::{ContainerRuntime, OutputChunk, OutputStream};

/// Per-execution state machine.
///
/// ```text
/// Pending ─► Admitted ─► Provisioning ─► Running ─► Completed | TimedOut | Failed
///    │                        │
///    └─► Rejected             └─► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Admitted,
    Provisioning,
    Running,
    Completed,
    TimedOut,
    Failed,
    Rejected,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::Failed
                | ExecutionState::Rejected
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Pending => write!(f, "pending"),
            ExecutionState::Admitted => write!(f, "admitted"),
            ExecutionState::Provisioning => write!(f, "provisioning"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Completed => write!(f, "completed"),
            ExecutionState::TimedOut => write!(f, "timed_out"),
            ExecutionState::Failed => write!(f, "failed"),
            ExecutionState::Rejected => write!(f, "rejected"),
        }
    }
}

/// How the running phase ended.
enum Exit {
    Exited(i64),
    Deadline,
    Lost(RuntimeError),
}

struct Transitions {
    submission_id: Uuid,
    state: ExecutionState,
}

impl Transitions {
    fn new(submission_id: Uuid) -> Self {
        Self {
            submission_id,
            state: ExecutionState::Pending,
        }
    }

    fn advance(&mut self, next: ExecutionState) {
        debug_assert!(!self.state.is_terminal(), "execution already terminal");
        tracing::debug!(
            submission_id = %self.submission_id,
            from = %self.state,
            to = %next,
            "Execution state change"
        );
        self.state = next;
    }
}

/// Drives one execution from admission to teardown.
///
/// Owns nothing per execution; a single supervisor serves every submission,
/// and each [`ExecutionSupervisor::run`] call owns its own slot and handle.
pub struct ExecutionSupervisor {
    config: Arc<OrchestratorConfig>,
    admission: Arc<AdmissionController>,
    lifecycle: LifecycleManager,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExecutionSupervisor {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        admission: Arc<AdmissionController>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            admission,
            lifecycle: LifecycleManager::new(runtime.clone()),
            runtime,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Run `request` end to end.
    ///
    /// The container is torn down and the slot released before this returns,
    /// whatever the outcome. The deadline starts once the container is running,
    /// so time spent queueing for a slot is not charged to the program.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let mut transitions = Transitions::new(request.id);

        let slot = match self.admission.acquire(self.config.admission_timeout).await {
            Ok(slot) => slot,
            Err(e) => {
                transitions.advance(ExecutionState::Rejected);
                tracing::info!(submission_id = %request.id, "Execution rejected, no capacity");
                return ExecutionResult::rejected(request.id, e);
            }
        };
        transitions.advance(ExecutionState::Admitted);

        let limits = request.limits.resolve(&self.config);
        transitions.advance(ExecutionState::Provisioning);
        let mut handle = match self.lifecycle.provision(&request, &limits).await {
            Ok(handle) => handle,
            Err(e) => {
                transitions.advance(ExecutionState::Failed);
                tracing::info!(submission_id = %request.id, error = %e, "Provisioning failed");
                slot.release();
                return ExecutionResult::failed(request.id, e.into(), Duration::ZERO);
            }
        };
        transitions.advance(ExecutionState::Running);

        let result = self.watch(&mut handle, request.id, limits.timeout).await;
        transitions.advance(match result.status {
            ExecutionStatus::Completed => ExecutionState::Completed,
            ExecutionStatus::TimedOut => ExecutionState::TimedOut,
            ExecutionStatus::Failed | ExecutionStatus::Rejected => ExecutionState::Failed,
        });

        self.lifecycle.teardown(handle).await;
        slot.release();

        tracing::info!(
            submission_id = %request.id,
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            truncated = result.partial_output_truncated(),
            "Execution finished"
        );
        result
    }

    /// Race the container's exit against the deadline while collecting output.
    async fn watch(
        &self,
        handle: &mut ExecutionHandle,
        submission_id: Uuid,
        timeout: Duration,
    ) -> ExecutionResult {
        let mut aggregator = ResultAggregator::new(submission_id, self.config.output_limit_bytes);
        let mut output = handle.take_output();
        let started = Instant::now();

        let exit = {
            let wait = self.runtime.wait(handle.container_id());
            tokio::pin!(wait);
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    status = &mut wait => break match status {
                        Ok(code) => Exit::Exited(code),
                        Err(e) => Exit::Lost(e),
                    },
                    _ = &mut deadline => break Exit::Deadline,
                    chunk = next_chunk(&mut output), if output.is_some() => match chunk {
                        Some(Ok(chunk)) => aggregator.push(chunk),
                        Some(Err(e)) => {
                            tracing::warn!(submission_id = %submission_id, error = %e, "Output stream failed");
                            output = None;
                        }
                        None => output = None,
                    },
                }
            }
        };
        let elapsed = started.elapsed();

        match exit {
            Exit::Exited(code) => {
                handle.set_state(ContainerState::Exited);
                self.drain(submission_id, &mut output, &mut aggregator).await;
                aggregator.completed(code, elapsed)
            }
            Exit::Deadline => {
                tracing::info!(
                    submission_id = %submission_id,
                    container_id = %handle.container_id(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Deadline reached, killing container"
                );
                if let Err(e) = self.runtime.kill(handle.container_id()).await {
                    tracing::warn!(
                        container_id = %handle.container_id(),
                        error = %e,
                        "Kill failed, relying on forced removal"
                    );
                }
                handle.set_state(ContainerState::Killed);
                self.drain(submission_id, &mut output, &mut aggregator).await;
                aggregator.timed_out(elapsed)
            }
            Exit::Lost(e) => {
                tracing::warn!(
                    submission_id = %submission_id,
                    container_id = %handle.container_id(),
                    error = %e,
                    "Lost track of running container"
                );
                aggregator.failed(ExecError::from(e), elapsed)
            }
        }
    }

    /// Read whatever output is still buffered, for at most `drain_grace`.
    async fn drain(
        &self,
        submission_id: Uuid,
        output: &mut Option<OutputStream>,
        aggregator: &mut ResultAggregator,
    ) {
        let Some(stream) = output.as_mut() else {
            return;
        };

        let drained = tokio::time::timeout(self.config.drain_grace, async {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => aggregator.push(chunk),
                    Err(_) => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::debug!(
                submission_id = %submission_id,
                grace_ms = self.config.drain_grace.as_millis() as u64,
                "Output still open after drain grace, dropping the rest"
            );
        }
        *output = None;
    }
}

async fn next_chunk(output: &mut Option<OutputStream>) -> Option<Result<OutputChunk, RuntimeError>> {
    match output {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
