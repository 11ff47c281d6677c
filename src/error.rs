use thiserror::Error;

/// Errors reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
///
/// The adapter never retries; every variant is surfaced to the caller as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container operation failed: {0}")]
    OperationFailed(String),
}

/// Caller-facing error taxonomy returned by [`Orchestrator::submit`](crate::orchestrator::Orchestrator::submit).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Rejected: execution capacity exhausted")]
    Overloaded,

    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container operation failed: {0}")]
    ContainerOperationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Short machine-readable name, used by transports.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Overloaded => "overloaded",
            ExecError::RuntimeUnavailable(_) => "runtime_unavailable",
            ExecError::ImageNotFound(_) => "image_not_found",
            ExecError::ContainerOperationFailed(_) => "container_operation_failed",
            ExecError::InvalidRequest(_) => "invalid_request",
            ExecError::Internal(_) => "internal",
        }
    }
}

impl From<RuntimeError> for ExecError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => ExecError::RuntimeUnavailable(msg),
            RuntimeError::ImageNotFound(image) => ExecError::ImageNotFound(image),
            RuntimeError::OperationFailed(msg) => ExecError::ContainerOperationFailed(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_map_onto_taxonomy() {
        assert_eq!(
            ExecError::from(RuntimeError::Unavailable("socket".into())),
            ExecError::RuntimeUnavailable("socket".into())
        );
        assert_eq!(
            ExecError::from(RuntimeError::ImageNotFound("nope:1".into())),
            ExecError::ImageNotFound("nope:1".into())
        );
        assert_eq!(
            ExecError::from(RuntimeError::OperationFailed("409".into())),
            ExecError::ContainerOperationFailed("409".into())
        );
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ExecError::Overloaded.kind(), "overloaded");
        assert_eq!(
            ExecError::InvalidRequest(String::new()).kind(),
            "invalid_request"
        );
    }
}
