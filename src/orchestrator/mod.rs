//! Containerized execution pipeline.
//!
//! A submission flows through these components:
//!
//! 1. [`AdmissionController`] hands out a bounded number of slots
//! 2. [`LifecycleManager`] provisions an isolated container
//! 3. [`ExecutionSupervisor`] races the program against its deadline
//! 4. [`ResultAggregator`] caps the captured output and builds the result
//!
//! [`Orchestrator`] is the entry point that ties them together.

pub mod admission;
pub mod lifecycle;
pub mod output;
pub mod request;
pub mod result;
pub mod supervisor;

use std::sync::Arc;

pub use admission::{AdmissionController, AdmissionStats, Slot};
pub use lifecycle::{ContainerState, ExecutionHandle, LifecycleManager};
pub use output::ResultAggregator;
pub use request::{ExecutionRequest, ResolvedLimits, ResourceLimits};
pub use result::{CapturedOutput, ExecutionResult, ExecutionStatus};
pub use supervisor::{ExecutionState, ExecutionSupervisor};

use crate::config::OrchestratorConfig;
use crate::error::{ExecError, Result};
use crate::runtime::ContainerRuntime;

/// Facade used by transports. Cheap to clone; clones share capacity.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    admission: Arc<AdmissionController>,
    supervisor: Arc<ExecutionSupervisor>,
}

impl Orchestrator {
    /// Build an orchestrator over `runtime`. The configuration is expected to
    /// have passed [`OrchestratorConfig::validate`].
    pub fn new(config: OrchestratorConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let config = Arc::new(config);
        let admission = Arc::new(AdmissionController::new(config.max_conn));
        let supervisor = Arc::new(ExecutionSupervisor::new(
            config.clone(),
            admission.clone(),
            runtime,
        ));

        Self {
            config,
            admission,
            supervisor,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    /// Execute one submission.
    ///
    /// `Completed` and `TimedOut` executions are returned as `Ok`; rejected and
    /// failed ones as the matching [`ExecError`]. The execution runs on its own
    /// task, so dropping the returned future does not interrupt teardown.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        request.validate(&self.config).inspect_err(|e| {
            tracing::info!(submission_id = %request.id, error = %e, "Submission rejected as invalid");
        })?;

        tracing::debug!(
            submission_id = %request.id,
            image = %request.image,
            source_bytes = request.source.len(),
            "Submission accepted"
        );

        let supervisor = self.supervisor.clone();
        let mut result = tokio::spawn(async move { supervisor.run(request).await })
            .await
            .map_err(|e| ExecError::Internal(format!("execution task failed: {}", e)))?;

        match result.error.take() {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Remove containers left behind by an earlier process.
    pub async fn sweep_orphans(&self) -> usize {
        self.supervisor.lifecycle().sweep_orphans().await
    }

    /// Refuse new submissions; running ones finish normally.
    pub fn close(&self) {
        self.admission.close();
    }
}
