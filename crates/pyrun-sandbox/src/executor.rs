//! Sandbox executor: validates a submission, then runs it in two supervised
//! child processes and assembles the result.
//!
//! Each execution gets its own staging directory, its own children and its
//! own capture buffers. The only shared state is the admission semaphore.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::assembler::{assemble, check_standalone, ExecutionOutput, ExecutionResult};
use crate::audit::{AuditEntryBuilder, AuditLogger, NoopAuditLogger};
use crate::detect::{detect, ExecutionStrategy, IsolationMode, LauncherConfig};
use crate::error::{SandboxError, Stage};
use crate::harness::{entry_command, standalone_command};
use crate::redact::redact_staging_path;
use crate::staging::StagedScript;
use crate::supervisor::{CommandLine, ProcessSupervisor, StageOutcome, DEFAULT_MAX_OUTPUT_SIZE};
use crate::validator::{validate_script, DEFAULT_ENTRY_FUNCTION, DEFAULT_MAX_CODE_SIZE};

/// `PATH` given to children when the host has none.
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Configuration for the sandbox executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Time budget for each stage.
    pub timeout: Duration,
    /// Maximum script size in bytes.
    pub max_code_size: usize,
    /// Maximum captured bytes per output stream.
    pub max_output_size: usize,
    /// Maximum concurrent executions.
    pub max_concurrent: usize,
    /// How long an execution may wait for a free slot.
    pub queue_timeout: Duration,
    /// Name of the function the harness calls.
    pub entry_function: String,
    /// Whether to run the script standalone before calling the entry function.
    pub standalone_check: bool,
    /// Launcher and interpreter selection.
    pub launcher: LauncherConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            max_concurrent: 8,
            queue_timeout: Duration::from_secs(30),
            entry_function: DEFAULT_ENTRY_FUNCTION.to_string(),
            standalone_check: true,
            launcher: LauncherConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// The complete environment handed to every child.
    ///
    /// Nothing else from the host environment is inherited. The hash seed is
    /// pinned so identical submissions produce identical output.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());
        vec![
            ("PATH".to_string(), path),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONHASHSEED".to_string(), "0".to_string()),
        ]
    }
}

/// The sandbox executor.
///
/// `Send + Sync`; share one instance behind an `Arc`. A semaphore bounds the
/// number of executions holding child processes at once.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    supervisor: ProcessSupervisor,
    audit_logger: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<crate::metrics::SandboxMetrics>>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a new sandbox executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        let supervisor = ProcessSupervisor::new(config.max_output_size, config.child_env());
        Self {
            config,
            semaphore,
            supervisor,
            audit_logger: logger,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attach Prometheus metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Validate and run `script`, returning the caller-facing result.
    ///
    /// Never fails: every error is rendered into [`ExecutionResult::error`].
    pub async fn execute(&self, script: &str) -> ExecutionResult {
        let (result, warnings) = self.run_with_warnings(script).await;
        ExecutionResult::from(result).with_warnings(warnings)
    }

    /// Validate and run `script`, keeping the typed error.
    pub async fn run(&self, script: &str) -> Result<ExecutionOutput, SandboxError> {
        self.run_with_warnings(script).await.0
    }

    async fn run_with_warnings(
        &self,
        script: &str,
    ) -> (Result<ExecutionOutput, SandboxError>, Vec<String>) {
        let started = Instant::now();
        let mut audit = AuditEntryBuilder::new(script);
        let mut warnings = Vec::new();

        tracing::info!(
            execution_id = %audit.execution_id(),
            code_len = script.len(),
            "execute: starting"
        );

        let result = self.pipeline(script, &mut audit, &mut warnings).await;

        let execution_id = audit.execution_id().to_string();
        let entry = audit.finish(&result);
        self.audit_logger.log(&entry).await;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_execution(
                entry.strategy.unwrap_or("none"),
                started.elapsed().as_secs_f64(),
            );
            if let Err(e) = &result {
                metrics.record_error(e.kind());
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(%execution_id, elapsed_ms, "execute: complete"),
            Err(e) if e.is_rejection() => {
                tracing::info!(%execution_id, error = %e, "execute: rejected")
            }
            Err(e) => tracing::warn!(
                %execution_id,
                kind = e.kind(),
                error = %e,
                elapsed_ms,
                "execute: failed"
            ),
        }

        (result, warnings)
    }

    async fn pipeline(
        &self,
        script: &str,
        audit: &mut AuditEntryBuilder,
        warnings: &mut Vec<String>,
    ) -> Result<ExecutionOutput, SandboxError> {
        validate_script(
            script,
            &self.config.entry_function,
            Some(self.config.max_code_size),
        )?;

        let _permit = self.admit().await?;
        #[cfg(feature = "metrics")]
        let _in_flight = self.metrics.as_deref().map(|m| m.track_in_flight());

        let launcher = &self.config.launcher;
        let strategy = detect(launcher);
        audit.strategy(strategy.label());
        if !strategy.is_isolated() {
            if launcher.isolation == IsolationMode::Required {
                return Err(SandboxError::IsolationUnavailable {
                    launcher: launcher.program.clone(),
                });
            }
            if let Some(warning) = strategy.warning(&launcher.program) {
                warnings.push(warning);
            }
        }

        let staged = StagedScript::create(script)?;
        let result = self.run_stages(&strategy, &staged, audit).await;
        staged.close();
        result
    }

    /// Wait for an execution slot, up to the queue timeout.
    async fn admit(&self) -> Result<OwnedSemaphorePermit, SandboxError> {
        let acquire = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout(self.config.queue_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }),
        }
    }

    async fn run_stages(
        &self,
        strategy: &ExecutionStrategy,
        staged: &StagedScript,
        audit: &mut AuditEntryBuilder,
    ) -> Result<ExecutionOutput, SandboxError> {
        let timeout = self.config.timeout;

        let stage1 = if self.config.standalone_check {
            let command = standalone_command(strategy, staged.script_path(), timeout);
            let outcome = self.run_stage(Stage::Standalone, &command, staged, audit).await;
            check_standalone(&outcome, timeout)?;
            Some(outcome)
        } else {
            None
        };

        let command = entry_command(
            strategy,
            staged.dir(),
            &self.config.entry_function,
            timeout,
        );
        let stage2 = self
            .run_stage(Stage::EntryFunction, &command, staged, audit)
            .await;

        assemble(
            stage1.as_ref(),
            &stage2,
            timeout,
            self.config.max_output_size,
        )
    }

    async fn run_stage(
        &self,
        stage: Stage,
        command: &CommandLine,
        staged: &StagedScript,
        audit: &mut AuditEntryBuilder,
    ) -> StageOutcome {
        let mut outcome = self.supervisor.run(command, self.config.timeout).await;
        outcome.stderr = redact_staging_path(&outcome.stderr, staged.dir());
        audit.record_stage(stage, &outcome);
        tracing::debug!(
            stage = stage.as_str(),
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            stderr_len = outcome.stderr.len(),
            "stage finished"
        );
        outcome
    }
}
