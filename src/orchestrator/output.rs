//! Output capture and result assembly.
//!
//! Each stream is held in an [`OutputBuffer`] with a hard byte ceiling.
//! Bytes past the ceiling are dropped and the buffer remembers that it
//! overflowed, so a result can never pass off truncated output as complete.

use std::time::Duration;

use uuid::Uuid;

use crate::error::ExecError;
use crate::orchestrator::result::{CapturedOutput, ExecutionResult, ExecutionStatus};
use crate::runtime::OutputChunk;

#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.data.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(bytes);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn into_captured(self) -> CapturedOutput {
        CapturedOutput::new(self.data, self.truncated)
    }
}

/// Collects the output of one execution and assembles its final result.
#[derive(Debug)]
pub struct ResultAggregator {
    submission_id: Uuid,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
}

impl ResultAggregator {
    pub fn new(submission_id: Uuid, limit_per_stream: usize) -> Self {
        Self {
            submission_id,
            stdout: OutputBuffer::new(limit_per_stream),
            stderr: OutputBuffer::new(limit_per_stream),
        }
    }

    pub fn push(&mut self, chunk: OutputChunk) {
        match chunk {
            OutputChunk::Stdout(bytes) => self.stdout.push(&bytes),
            OutputChunk::Stderr(bytes) => self.stderr.push(&bytes),
        }
    }

    pub fn completed(self, exit_code: i64, duration: Duration) -> ExecutionResult {
        self.finish(ExecutionStatus::Completed, Some(exit_code), duration)
    }

    pub fn timed_out(self, duration: Duration) -> ExecutionResult {
        self.finish(ExecutionStatus::TimedOut, None, duration)
    }

    /// Failed executions do not return partial output.
    pub fn failed(self, error: ExecError, duration: Duration) -> ExecutionResult {
        ExecutionResult::failed(self.submission_id, error, duration)
    }

    fn finish(
        self,
        status: ExecutionStatus,
        exit_code: Option<i64>,
        duration: Duration,
    ) -> ExecutionResult {
        if self.stdout.truncated() || self.stderr.truncated() {
            tracing::debug!(
                submission_id = %self.submission_id,
                stdout_bytes = self.stdout.len(),
                stderr_bytes = self.stderr.len(),
                "Output truncated at ceiling"
            );
        }

        ExecutionResult {
            submission_id: self.submission_id,
            status,
            exit_code,
            stdout: self.stdout.into_captured(),
            stderr: self.stderr.into_captured(),
            duration,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_under_limit_is_complete() {
        let mut buf = OutputBuffer::new(8);
        buf.push(b"abc");
        buf.push(b"de");
        assert_eq!(buf.len(), 5);
        assert!(!buf.truncated());
    }

    #[test]
    fn buffer_exactly_at_limit_is_not_truncated() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"abcd");
        assert_eq!(buf.len(), 4);
        assert!(!buf.truncated());

        // Nothing more fits; even an empty push keeps the flag clear
        buf.push(b"");
        assert!(!buf.truncated());
    }

    #[test]
    fn buffer_overflow_keeps_exactly_limit_bytes() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"ab");
        buf.push(b"cdef");
        buf.push(b"gh");
        assert!(buf.truncated());
        assert_eq!(buf.into_captured().bytes(), b"abcd");
    }

    #[test]
    fn zero_limit_drops_everything() {
        let mut buf = OutputBuffer::new(0);
        buf.push(b"x");
        assert!(buf.is_empty());
        assert!(buf.truncated());
    }

    #[test]
    fn aggregator_keeps_streams_apart() {
        let id = Uuid::new_v4();
        let mut agg = ResultAggregator::new(id, 3);
        agg.push(OutputChunk::Stdout(b"out".to_vec()));
        agg.push(OutputChunk::Stderr(b"error".to_vec()));

        let result = agg.completed(0, Duration::from_millis(5));
        assert_eq!(result.submission_id, id);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.bytes(), b"out");
        assert!(!result.stdout.truncated());
        assert_eq!(result.stderr.bytes(), b"err");
        assert!(result.stderr.truncated());
        assert!(result.partial_output_truncated());
        assert!(result.error.is_none());
    }

    #[test]
    fn timed_out_keeps_output_without_exit_code() {
        let mut agg = ResultAggregator::new(Uuid::new_v4(), 64);
        agg.push(OutputChunk::Stdout(b"tick\n".to_vec()));
        let result = agg.timed_out(Duration::from_millis(100));
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.exit_code.is_none());
        assert_eq!(result.stdout.text(), "tick\n");
    }

    #[test]
    fn failed_discards_partial_output() {
        let mut agg = ResultAggregator::new(Uuid::new_v4(), 64);
        agg.push(OutputChunk::Stdout(b"partial".to_vec()));
        let result = agg.failed(
            ExecError::RuntimeUnavailable("gone".to_string()),
            Duration::from_millis(1),
        );
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.stdout.is_empty());
        assert!(result.error.is_some());
    }
}
