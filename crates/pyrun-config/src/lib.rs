#![warn(missing_docs)]

//! # pyrun-config
//!
//! Configuration loading for the pyrun script executor.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every field is an optional override; anything left out falls back to the
//! defaults baked into `pyrun-sandbox` and `pyrun-server`.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_secs = 10
//! max_concurrent = 8
//! isolation = "auto"
//!
//! [sandbox.launcher]
//! program = "nsjail"
//! interpreter = "/usr/bin/python3"
//!
//! [server]
//! bind = "0.0.0.0:${PORT}"
//!
//! [audit]
//! path = "/var/log/pyrun/audit.jsonl"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Accepted values for `sandbox.isolation`.
pub const ISOLATION_MODES: &[&str] = &["auto", "disabled", "required"];

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level pyrun configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PyrunConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerOverrides,

    /// Audit trail settings.
    #[serde(default)]
    pub audit: AuditOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Per-stage execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum captured output per stream in kilobytes.
    #[serde(default)]
    pub max_output_size_kb: Option<usize>,

    /// Maximum concurrent executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// How long a request may wait for an execution slot, in seconds.
    #[serde(default)]
    pub queue_timeout_secs: Option<u64>,

    /// Name of the function the harness invokes.
    #[serde(default)]
    pub entry_function: Option<String>,

    /// Whether to run the script standalone before invoking the entry function.
    #[serde(default)]
    pub standalone_check: Option<bool>,

    /// Interpreter used when no launcher wraps the execution.
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Isolation policy: "auto" (default), "disabled" or "required".
    #[serde(default)]
    pub isolation: Option<String>,

    /// Isolation launcher settings.
    #[serde(default)]
    pub launcher: LauncherOverrides,
}

/// Isolation launcher overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LauncherOverrides {
    /// Launcher executable name or absolute path (default: "nsjail").
    #[serde(default)]
    pub program: Option<String>,

    /// Interpreter path the launcher executes inside the jail.
    #[serde(default)]
    pub interpreter: Option<String>,
}

/// HTTP server overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerOverrides {
    /// Socket address to listen on, e.g. "0.0.0.0:8080".
    #[serde(default)]
    pub bind: Option<String>,
}

/// Audit trail overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditOverrides {
    /// Append audit entries as JSON lines to this file. When unset, entries
    /// go to the tracing log.
    #[serde(default)]
    pub path: Option<String>,
}

impl PyrunConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PyrunConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;

        if sandbox.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_secs must be greater than zero".into(),
            ));
        }
        if sandbox.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be greater than zero".into(),
            ));
        }
        if sandbox.max_code_size_kb == Some(0) || sandbox.max_output_size_kb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox size limits must be greater than zero".into(),
            ));
        }

        if let Some(name) = &sandbox.entry_function {
            if !is_python_identifier(name) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.entry_function '{}' is not a valid Python identifier",
                    name
                )));
            }
        }

        if let Some(mode) = &sandbox.isolation {
            if !ISOLATION_MODES.contains(&mode.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.isolation '{}' is unsupported, supported: {}",
                    mode,
                    ISOLATION_MODES.join(", ")
                )));
            }
        }

        for (field, value) in [
            ("sandbox.interpreter", &sandbox.interpreter),
            ("sandbox.launcher.program", &sandbox.launcher.program),
            ("sandbox.launcher.interpreter", &sandbox.launcher.interpreter),
            ("server.bind", &self.server.bind),
            ("audit.path", &self.audit.path),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
            }
        }

        Ok(())
    }
}

/// ASCII-only identifier check; the value ends up on a command line, so
/// anything exotic is refused rather than interpreted.
fn is_python_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
