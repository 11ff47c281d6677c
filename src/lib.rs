pub mod api;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod runtime;
pub mod shutdown;

pub use error::{ExecError, Result, RuntimeError};
pub use orchestrator::{ExecutionRequest, ExecutionResult, ExecutionStatus, Orchestrator};
