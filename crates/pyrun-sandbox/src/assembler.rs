//! Normalizes the two stage outcomes into one result.
//!
//! Precedence, first match wins:
//! 1. stage 1 timed out
//! 2. stage 1 failed to launch
//! 3. stage 2 timed out
//! 4. stage 2 wrote to stderr
//! 5. stage 2 stdout was truncated
//! 6. stage 2 stdout is not a single well-formed envelope
//! 7. the envelope reports a failure
//! 8. success
//!
//! A non-zero exit from stage 1 is not itself an error: stage 2 reports the
//! same fault with better detail.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::{SandboxError, Stage};
use crate::harness::{parse_envelope, HarnessEnvelope};
use crate::supervisor::StageOutcome;

/// What a successful execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// The entry function's return value.
    pub result: Value,
    /// Everything the entry function printed.
    pub stdout: String,
}

/// The caller-facing result: exactly one of `error` or (`result`, `stdout`).
///
/// Serialize-only. A successful `null` result is `Some(Value::Null)` and
/// is written as `"result": null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Return value on success (may itself be JSON `null`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Captured output on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Human-readable failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Conditions the caller should know about even on success, such as
    /// running without isolation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Whether the execution succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Attach warnings.
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

impl From<Result<ExecutionOutput, SandboxError>> for ExecutionResult {
    fn from(result: Result<ExecutionOutput, SandboxError>) -> Self {
        match result {
            Ok(output) => Self {
                result: Some(output.result),
                stdout: Some(output.stdout),
                error: None,
                warnings: Vec::new(),
            },
            Err(e) => Self {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Interpret stage 1. Only timeouts and launch failures are errors.
pub fn check_standalone(stage1: &StageOutcome, timeout: Duration) -> Result<(), SandboxError> {
    if stage1.timed_out {
        return Err(SandboxError::Timeout {
            stage: Stage::Standalone,
            timeout,
        });
    }
    if stage1.launch_failed() {
        return Err(SandboxError::LaunchFailure {
            detail: stage1.stderr.trim_end().to_string(),
        });
    }
    if !stage1.succeeded() {
        tracing::debug!(
            exit_code = stage1.exit_code,
            "standalone run exited non-zero, deferring to the entry function stage"
        );
    }
    Ok(())
}

/// Interpret stage 2.
///
/// `max_output` is the capture limit, reported when stdout was truncated.
pub fn interpret_harness(
    stage2: &StageOutcome,
    timeout: Duration,
    max_output: usize,
) -> Result<ExecutionOutput, SandboxError> {
    if stage2.timed_out {
        return Err(SandboxError::Timeout {
            stage: Stage::EntryFunction,
            timeout,
        });
    }
    if !stage2.stderr.trim().is_empty() {
        return Err(SandboxError::HarnessFault {
            stderr: stage2.stderr.clone(),
        });
    }
    if stage2.truncated {
        return Err(SandboxError::OutputTooLarge { max: max_output });
    }

    match parse_envelope(&stage2.stdout) {
        Ok(HarnessEnvelope::Success { result, stdout }) => Ok(ExecutionOutput { result, stdout }),
        Ok(HarnessEnvelope::Failure { error }) => Err(SandboxError::ScriptFault { message: error }),
        Err(detail) => Err(SandboxError::MalformedEnvelope { detail }),
    }
}

/// Combine both stages. `stage1` is `None` when the standalone run is
/// disabled.
pub fn assemble(
    stage1: Option<&StageOutcome>,
    stage2: &StageOutcome,
    timeout: Duration,
    max_output: usize,
) -> Result<ExecutionOutput, SandboxError> {
    if let Some(stage1) = stage1 {
        check_standalone(stage1, timeout)?;
    }
    interpret_harness(stage2, timeout, max_output)
}
