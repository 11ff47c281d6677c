use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Failed,
    Rejected,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::TimedOut => write!(f, "timed_out"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Bytes captured from one output stream.
///
/// The bytes are opaque; [`CapturedOutput::text`] gives a lossy UTF-8 view
/// for transports that need text. Check [`CapturedOutput::truncated`] before
/// treating the bytes as the program's complete output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedOutput {
    pub(crate) fn new(bytes: Vec<u8>, truncated: bool) -> Self {
        Self { bytes, truncated }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// True when the program wrote more than the configured ceiling.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Outcome of one execution.
///
/// `error` is set exactly when `status` is `Failed` or `Rejected`;
/// `exit_code` only when it is `Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub submission_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Time from container start to the terminal state; zero if nothing ran
    pub duration: Duration,
    pub error: Option<ExecError>,
}

impl ExecutionResult {
    pub(crate) fn rejected(submission_id: Uuid, error: ExecError) -> Self {
        Self::unsuccessful(submission_id, ExecutionStatus::Rejected, error, Duration::ZERO)
    }

    pub(crate) fn failed(submission_id: Uuid, error: ExecError, duration: Duration) -> Self {
        Self::unsuccessful(submission_id, ExecutionStatus::Failed, error, duration)
    }

    fn unsuccessful(
        submission_id: Uuid,
        status: ExecutionStatus,
        error: ExecError,
        duration: Duration,
    ) -> Self {
        Self {
            submission_id,
            status,
            exit_code: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration,
            error: Some(error),
        }
    }

    /// True when either stream lost bytes to the output ceiling.
    pub fn partial_output_truncated(&self) -> bool {
        self.stdout.truncated() || self.stderr.truncated()
    }
}
