//! Audit logging for script executions.
//!
//! Every execution emits an [`AuditEntry`] containing:
//! - Execution ID (UUID)
//! - SHA-256 hash of the script (never the raw script in logs)
//! - A redacted preview of the first 500 bytes of the script
//! - The execution strategy and per-stage timings
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::assembler::ExecutionOutput;
use crate::error::{SandboxError, Stage};
use crate::supervisor::StageOutcome;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// When the execution was accepted.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted script.
    pub code_hash: String,
    /// First bytes of the script with credentials redacted.
    pub code_preview: String,
    /// `isolated` or `direct`; absent when rejected before detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<&'static str>,
    /// Child processes that were run, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageAudit>,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the serialized result in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// Audit record for one child process.
#[derive(Debug, Clone, Serialize)]
pub struct StageAudit {
    /// Which stage.
    pub stage: &'static str,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Exit code reported by the supervisor.
    pub exit_code: i32,
    /// Whether the child was killed on timeout.
    pub timed_out: bool,
}

/// The outcome of an execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The entry function returned a result.
    Success,
    /// The script was refused before anything ran.
    Rejected {
        /// Validation message.
        message: String,
    },
    /// A stage exceeded its time budget.
    Timeout,
    /// Any other failure.
    Error {
        /// Stable error label from [`SandboxError::kind`].
        kind: &'static str,
        /// Redacted error message.
        message: String,
    },
}

impl AuditOutcome {
    /// Short label for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected { .. } => "rejected",
            Self::Timeout => "timeout",
            Self::Error { .. } => "error",
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the logger and return the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` with `audit = true` for easy filtering.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            code_hash = %entry.code_hash,
            strategy = entry.strategy.unwrap_or("none"),
            stages = entry.stages.len(),
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            outcome = entry.outcome.label(),
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Builder for constructing audit entries during execution.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    strategy: Option<&'static str>,
    stages: Vec<StageAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry for a submission.
    pub fn new(code: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: crate::redact::redact_secrets(&code_preview(code)),
            strategy: None,
            stages: Vec::new(),
            start: Instant::now(),
        }
    }

    /// The execution ID, for correlating log lines.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record the chosen strategy label.
    pub fn strategy(&mut self, label: &'static str) {
        self.strategy = Some(label);
    }

    /// Record a completed stage.
    pub fn record_stage(&mut self, stage: Stage, outcome: &StageOutcome) {
        self.stages.push(StageAudit {
            stage: stage.as_str(),
            duration_ms: outcome.elapsed.as_millis() as u64,
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
        });
    }

    /// Finalize the audit entry with the execution result.
    pub fn finish(self, result: &Result<ExecutionOutput, SandboxError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match result {
            Ok(output) => {
                let size = serde_json::to_string(&output.result)
                    .map(|s| s.len())
                    .unwrap_or(0);
                (size, AuditOutcome::Success)
            }
            Err(SandboxError::Timeout { .. }) => (0, AuditOutcome::Timeout),
            Err(e) if e.is_rejection() => (
                0,
                AuditOutcome::Rejected {
                    message: e.to_string(),
                },
            ),
            Err(e) => (
                0,
                AuditOutcome::Error {
                    kind: e.kind(),
                    message: crate::redact::redact_secrets(&e.to_string()),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            strategy: self.strategy,
            stages: self.stages,
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn output(result: serde_json::Value) -> ExecutionOutput {
        ExecutionOutput {
            result,
            stdout: String::new(),
        }
    }

    #[test]
    fn sha256_hex_produces_correct_hash() {
        // Known SHA-256 of "hello"
        assert_eq!(
            sha256_hex("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn code_preview_short_code_unchanged() {
        let code = "def main():\n    return 42\n";
        assert_eq!(code_preview(code), code);
    }

    #[test]
    fn code_preview_long_code_truncated() {
        let code = "x".repeat(1000);
        let preview = code_preview(&code);
        assert_eq!(preview.len(), 503);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn code_preview_multibyte_boundary() {
        // 499 ASCII bytes then a 4-byte char straddling the limit.
        let mut code = "a".repeat(499);
        code.push('\u{1F600}');
        code.push_str(&"b".repeat(100));
        let preview = code_preview(&code);
        assert_eq!(preview, format!("{}...", "a".repeat(499)));
    }

    #[test]
    fn builder_success() {
        let builder = AuditEntryBuilder::new("def main():\n    return 1\n");
        let entry = builder.finish(&Ok(output(serde_json::json!(1))));
        assert!(!entry.execution_id.is_empty());
        assert!(matches!(entry.outcome, AuditOutcome::Success));
        assert_eq!(entry.result_size_bytes, 1);
        assert!(entry.strategy.is_none());
    }

    #[test]
    fn builder_rejection() {
        let builder = AuditEntryBuilder::new("print('x')");
        let err = SandboxError::MissingEntryFunction {
            name: "main".into(),
        };
        let entry = builder.finish(&Err(err));
        match entry.outcome {
            AuditOutcome::Rejected { message } => assert!(message.contains("must define")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn builder_timeout_with_stages() {
        let mut builder = AuditEntryBuilder::new("def main():\n    while True: pass\n");
        builder.strategy("direct");
        builder.record_stage(
            Stage::EntryFunction,
            &StageOutcome {
                exit_code: 137,
                timed_out: true,
                elapsed: Duration::from_millis(1500),
                ..Default::default()
            },
        );
        let entry = builder.finish(&Err(SandboxError::Timeout {
            stage: Stage::EntryFunction,
            timeout: Duration::from_secs(1),
        }));
        assert!(matches!(entry.outcome, AuditOutcome::Timeout));
        assert_eq!(entry.strategy, Some("direct"));
        assert_eq!(entry.stages.len(), 1);
        assert_eq!(entry.stages[0].stage, "entry_function");
        assert_eq!(entry.stages[0].duration_ms, 1500);
        assert!(entry.stages[0].timed_out);
    }

    #[test]
    fn error_outcome_carries_kind_and_redacts() {
        let builder = AuditEntryBuilder::new("x");
        let err = SandboxError::ScriptFault {
            message: "bad token=abc123secret".into(),
        };
        let entry = builder.finish(&Err(err));
        match entry.outcome {
            AuditOutcome::Error { kind, message } => {
                assert_eq!(kind, "script_fault");
                assert!(!message.contains("abc123secret"), "{message}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn preview_redacts_credentials() {
        let code = "API = 'x'\napi_key = 'sk-live-123456'\ndef main():\n    return 1\n";
        let entry = AuditEntryBuilder::new(code).finish(&Ok(output(serde_json::json!(1))));
        assert!(!entry.code_preview.contains("sk-live-123456"));
        assert!(entry.code_preview.contains("def main()"));
    }

    #[tokio::test]
    async fn json_lines_logger_writes_valid_json() {
        let logger = JsonLinesAuditLogger::new(Vec::<u8>::new());
        let mut builder = AuditEntryBuilder::new("def main():\n    return 1\n");
        builder.strategy("isolated");
        let entry = builder.finish(&Ok(output(serde_json::json!({"a": 1}))));
        logger.log(&entry).await;
        logger.log(&entry).await;

        let buf = logger.into_inner();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["strategy"], "isolated");
        assert_eq!(parsed["outcome"], "success");
        assert_eq!(parsed["code_hash"].as_str().unwrap().len(), 64);
        assert!(parsed.get("stages").is_none(), "empty stages are omitted");
    }

    #[tokio::test]
    async fn tracing_logger_does_not_panic() {
        let entry = AuditEntryBuilder::new("x").finish(&Err(SandboxError::EmptyScript));
        TracingAuditLogger.log(&entry).await;
        NoopAuditLogger.log(&entry).await;
    }

    #[test]
    fn entry_never_contains_raw_code_beyond_preview() {
        let code = format!("def main():\n    return 1\n# {}", "secret-tail ".repeat(100));
        let entry = AuditEntryBuilder::new(&code).finish(&Ok(output(serde_json::json!(1))));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains(&code));
        assert!(json.contains(&entry.code_hash));
    }
}
