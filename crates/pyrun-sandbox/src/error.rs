//! Error types for the pyrun sandbox.
//!
//! Every variant renders as the single human-readable string that reaches
//! the caller in [`ExecutionResult::error`](crate::ExecutionResult).

use thiserror::Error;

/// Which of the two child-process stages an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The script run as a standalone program.
    Standalone,
    /// The harness driver invoking the entry function.
    EntryFunction,
}

impl Stage {
    /// Short label used in logs and audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::EntryFunction => "entry_function",
        }
    }
}

/// Errors that can occur while validating or executing a submission.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The script is empty or whitespace only.
    #[error("script is empty")]
    EmptyScript,

    /// The script exceeds the configured maximum size.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The script does not parse.
    #[error("syntax error in script: {detail}")]
    Syntax {
        /// Parser diagnostic.
        detail: String,
    },

    /// No function with the entry name is defined anywhere in the script.
    #[error("script must define a '{name}()' entry function")]
    MissingEntryFunction {
        /// Configured entry function name.
        name: String,
    },

    /// The entry function never returns a value.
    #[error("'{name}()' entry function must have a return statement")]
    MissingReturn {
        /// Configured entry function name.
        name: String,
    },

    /// A denylisted term appears in the source text.
    #[error("script contains potentially dangerous operation: {term}")]
    BannedPattern {
        /// The denylist entry that matched.
        term: String,
    },

    /// A stage exceeded its time budget and was killed.
    #[error("{} execution timed out ({} seconds)", stage_subject(*stage), timeout.as_secs())]
    Timeout {
        /// The stage that timed out.
        stage: Stage,
        /// The budget that was exceeded.
        timeout: std::time::Duration,
    },

    /// The standalone stage could not be started.
    #[error("error running script: {detail}")]
    LaunchFailure {
        /// Launch error reported by the supervisor.
        detail: String,
    },

    /// The harness driver wrote to stderr.
    #[error("error executing entry function: {stderr}")]
    HarnessFault {
        /// Captured (redacted) stderr of the driver.
        stderr: String,
    },

    /// The harness driver's stdout was not a single well-formed envelope.
    #[error("could not run entry function or output is not valid structured data: {detail}")]
    MalformedEnvelope {
        /// Why the output could not be interpreted.
        detail: String,
    },

    /// Stage output exceeded the capture limit.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum captured bytes per stream.
        max: usize,
    },

    /// The entry function raised, or returned something JSON cannot represent.
    #[error("{message}")]
    ScriptFault {
        /// The exception message reported by the driver.
        message: String,
    },

    /// Isolation is required but no launcher is installed.
    #[error("isolation launcher '{launcher}' not found and isolation is required")]
    IsolationUnavailable {
        /// The launcher that was looked up.
        launcher: String,
    },

    /// No execution slot became free within the queue timeout.
    #[error("too many concurrent executions (max {max}), try again later")]
    ConcurrencyLimit {
        /// Maximum concurrent executions.
        max: usize,
    },

    /// The staging directory or script file could not be created.
    #[error("failed to stage script: {0}")]
    Staging(#[from] std::io::Error),
}

fn stage_subject(stage: Stage) -> &'static str {
    match stage {
        Stage::Standalone => "script",
        Stage::EntryFunction => "entry function",
    }
}

impl SandboxError {
    /// Returns a stable snake_case label for metrics and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyScript
            | Self::CodeTooLarge { .. }
            | Self::Syntax { .. }
            | Self::MissingEntryFunction { .. }
            | Self::MissingReturn { .. }
            | Self::BannedPattern { .. } => "rejected",
            Self::Timeout { .. } => "timeout",
            Self::LaunchFailure { .. } => "launch_failure",
            Self::HarnessFault { .. }
            | Self::MalformedEnvelope { .. }
            | Self::OutputTooLarge { .. } => "harness_fault",
            Self::ScriptFault { .. } => "script_fault",
            Self::IsolationUnavailable { .. } => "isolation_unavailable",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::Staging(_) => "internal",
        }
    }

    /// Whether the submission was refused before anything was executed.
    pub fn is_rejection(&self) -> bool {
        self.kind() == "rejected"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeout_messages_name_the_stage() {
        let standalone = SandboxError::Timeout {
            stage: Stage::Standalone,
            timeout: Duration::from_secs(10),
        };
        assert_eq!(
            standalone.to_string(),
            "script execution timed out (10 seconds)"
        );

        let entry = SandboxError::Timeout {
            stage: Stage::EntryFunction,
            timeout: Duration::from_secs(10),
        };
        assert_eq!(
            entry.to_string(),
            "entry function execution timed out (10 seconds)"
        );
    }

    #[test]
    fn banned_pattern_names_the_term() {
        let err = SandboxError::BannedPattern {
            term: "subprocess".into(),
        };
        assert_eq!(
            err.to_string(),
            "script contains potentially dangerous operation: subprocess"
        );
        assert!(err.is_rejection());
    }

    #[test]
    fn script_fault_is_passed_through_verbatim() {
        let err = SandboxError::ScriptFault {
            message: "division by zero".into(),
        };
        assert_eq!(err.to_string(), "division by zero");
        assert_eq!(err.kind(), "script_fault");
    }

    #[test]
    fn kinds_group_the_taxonomy() {
        assert_eq!(
            SandboxError::MissingEntryFunction { name: "main".into() }.kind(),
            "rejected"
        );
        assert_eq!(
            SandboxError::LaunchFailure { detail: "x".into() }.kind(),
            "launch_failure"
        );
        assert_eq!(
            SandboxError::MalformedEnvelope { detail: "x".into() }.kind(),
            "harness_fault"
        );
        assert_eq!(SandboxError::ConcurrencyLimit { max: 1 }.kind(), "concurrency_limit");
        assert!(!SandboxError::OutputTooLarge { max: 1 }.is_rejection());
    }

    #[test]
    fn staging_io_errors_are_internal() {
        let err: SandboxError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), "internal");
        assert_eq!(err.to_string(), "failed to stage script: disk full");
    }
}
