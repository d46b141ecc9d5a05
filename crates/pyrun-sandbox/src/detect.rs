//! Isolation launcher detection and execution strategy selection.
//!
//! The launcher is looked up on `PATH` once per execution. Its absence is an
//! expected condition: the strategy degrades to [`ExecutionStrategy::Direct`]
//! and the caller is told so through a warning on the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Launcher executable looked up on `PATH` by default.
pub const DEFAULT_LAUNCHER: &str = "nsjail";

/// Interpreter the launcher executes inside the jail by default.
pub const DEFAULT_JAILED_INTERPRETER: &str = "/usr/bin/python3";

/// Interpreter used for direct execution by default.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Whether the isolation launcher is looked up, skipped or mandatory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationMode {
    /// Use the launcher when it is installed, run directly otherwise.
    #[default]
    Auto,
    /// Never use the launcher.
    Disabled,
    /// Refuse to execute when the launcher is not installed.
    Required,
}

impl IsolationMode {
    /// Parse a config value ("auto", "disabled", "required").
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "disabled" => Some(Self::Disabled),
            "required" => Some(Self::Required),
            _ => None,
        }
    }
}

/// Launcher and interpreter settings.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Launcher executable name or absolute path.
    pub program: String,
    /// Interpreter path handed to the launcher's `--exec`.
    pub jailed_interpreter: String,
    /// Interpreter used when running without the launcher.
    pub interpreter: String,
    /// Lookup policy.
    pub isolation: IsolationMode,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_LAUNCHER.to_string(),
            jailed_interpreter: DEFAULT_JAILED_INTERPRETER.to_string(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            isolation: IsolationMode::default(),
        }
    }
}

/// How the child processes of one execution are launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Wrap the interpreter in the isolation launcher found at this path.
    Isolated {
        /// Resolved launcher path.
        launcher: PathBuf,
        /// Interpreter executed inside the jail.
        interpreter: String,
    },
    /// Run the interpreter directly, without any isolation.
    Direct {
        /// Interpreter executable.
        interpreter: String,
        /// Why isolation is not in effect.
        reason: DirectReason,
    },
}

/// Why an execution runs without the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectReason {
    /// The launcher was not found on `PATH`.
    LauncherMissing,
    /// Isolation is disabled by configuration.
    Disabled,
}

impl ExecutionStrategy {
    /// Short label used in logs, audit records and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Isolated { .. } => "isolated",
            Self::Direct { .. } => "direct",
        }
    }

    /// Whether the launcher wraps the execution.
    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::Isolated { .. })
    }

    /// Build the program and leading arguments for running the interpreter
    /// with `interpreter_args` under this strategy.
    ///
    /// The launcher form is
    /// `<launcher> --quiet --mode o --time_limit <secs> --exec <interpreter> -- <args...>`.
    pub fn command_prefix(
        &self,
        time_limit: Duration,
        interpreter_args: Vec<String>,
    ) -> (String, Vec<String>) {
        match self {
            Self::Isolated {
                launcher,
                interpreter,
            } => {
                let mut args = vec![
                    "--quiet".to_string(),
                    "--mode".to_string(),
                    "o".to_string(),
                    "--time_limit".to_string(),
                    time_limit.as_secs().max(1).to_string(),
                    "--exec".to_string(),
                    interpreter.clone(),
                    "--".to_string(),
                ];
                args.extend(interpreter_args);
                (launcher.to_string_lossy().into_owned(), args)
            }
            Self::Direct { interpreter, .. } => (interpreter.clone(), interpreter_args),
        }
    }

    /// Degraded-security notice for direct execution, `None` when isolated.
    pub fn warning(&self, launcher: &str) -> Option<String> {
        match self {
            Self::Isolated { .. } => None,
            Self::Direct {
                reason: DirectReason::LauncherMissing,
                ..
            } => Some(format!(
                "script ran without sandbox isolation (no '{}' launcher found)",
                launcher
            )),
            Self::Direct {
                reason: DirectReason::Disabled,
                ..
            } => Some(
                "script ran without sandbox isolation (isolation disabled by configuration)"
                    .to_string(),
            ),
        }
    }
}

/// Inspect the host and pick a strategy. Never fails.
///
/// With [`IsolationMode::Required`] a missing launcher still yields
/// `Direct { reason: LauncherMissing }`; refusing to run is the caller's call.
pub fn detect(config: &LauncherConfig) -> ExecutionStrategy {
    if config.isolation == IsolationMode::Disabled {
        return ExecutionStrategy::Direct {
            interpreter: config.interpreter.clone(),
            reason: DirectReason::Disabled,
        };
    }

    match resolve_launcher(&config.program) {
        Some(launcher) => {
            tracing::debug!(launcher = %launcher.display(), "isolation launcher found");
            ExecutionStrategy::Isolated {
                launcher,
                interpreter: config.jailed_interpreter.clone(),
            }
        }
        None => {
            tracing::warn!(
                launcher = %config.program,
                "isolation launcher not found, scripts will run without sandbox isolation"
            );
            ExecutionStrategy::Direct {
                interpreter: config.interpreter.clone(),
                reason: DirectReason::LauncherMissing,
            }
        }
    }
}

fn resolve_launcher(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.is_absolute() {
        return is_executable(path).then(|| path.to_path_buf());
    }
    which::which(program).ok()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
