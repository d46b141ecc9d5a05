#![warn(missing_docs)]

//! pyrun: validated, time-boxed execution of Python entry functions.
//!
//! ```text
//! pyrun [serve]        start the HTTP API
//! pyrun run <file>     execute one script and print the result as JSON
//! pyrun --version
//!
//! -c, --config <path>  config file, before or after the subcommand
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pyrun_config::{AuditOverrides, PyrunConfig, SandboxOverrides, ServerOverrides};
use pyrun_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, TracingAuditLogger};
use pyrun_sandbox::{IsolationMode, SandboxConfig, SandboxExecutor};
use tracing_subscriber::EnvFilter;

const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Parser)]
#[command(name = "pyrun", version, about = "Validated, time-boxed execution of Python entry functions")]
struct Cli {
    /// Config file (default: $PYRUN_CONFIG, then ./pyrun.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Start the HTTP API (default)
    Serve,
    /// Execute one script and print the result as JSON
    Run {
        /// Python file defining the entry function
        script: PathBuf,
    },
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(timeout) = overrides.timeout_secs {
        config.timeout = Duration::from_secs(timeout);
    }
    if let Some(kb) = overrides.max_code_size_kb {
        config.max_code_size = kb * 1024;
    }
    if let Some(kb) = overrides.max_output_size_kb {
        config.max_output_size = kb * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(secs) = overrides.queue_timeout_secs {
        config.queue_timeout = Duration::from_secs(secs);
    }
    if let Some(ref name) = overrides.entry_function {
        config.entry_function = name.clone();
    }
    if let Some(check) = overrides.standalone_check {
        config.standalone_check = check;
    }
    if let Some(ref interpreter) = overrides.interpreter {
        config.launcher.interpreter = interpreter.clone();
    }
    // Values were checked when the config was loaded.
    if let Some(mode) = overrides.isolation.as_deref().and_then(IsolationMode::parse) {
        config.launcher.isolation = mode;
    }
    if let Some(ref program) = overrides.launcher.program {
        config.launcher.program = program.clone();
    }
    if let Some(ref interpreter) = overrides.launcher.interpreter {
        config.launcher.jailed_interpreter = interpreter.clone();
    }
    config
}

/// Resolve the listen address. `PORT`, when set, replaces the port.
fn bind_address(overrides: &ServerOverrides, port: Option<&str>) -> Result<SocketAddr> {
    let bind = overrides.bind.as_deref().unwrap_or(DEFAULT_BIND);
    let mut addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid server.bind address '{bind}'"))?;
    if let Some(port) = port {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid PORT value '{port}'"))?;
        addr.set_port(port);
    }
    Ok(addr)
}

async fn audit_logger(overrides: &AuditOverrides) -> Result<Arc<dyn AuditLogger>> {
    match &overrides.path {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open audit log {path}"))?;
            tracing::info!(path = %path, "writing audit entries as JSON lines");
            Ok(Arc::new(JsonLinesAuditLogger::new(file)))
        }
        None => Ok(Arc::new(TracingAuditLogger)),
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config` on the command line
/// 2. `PYRUN_CONFIG` environment variable
/// 3. `./pyrun.toml` in the current directory
/// 4. None (defaults apply; not an error)
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("PYRUN_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("pyrun.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(explicit: Option<&Path>) -> Result<PyrunConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PyrunConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(PyrunConfig::default())
        }
    }
}

/// Execute one script file and print the result. Returns whether it succeeded.
async fn run_script(executor: &SandboxExecutor, path: &Path) -> Result<bool> {
    let script = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let result = executor.execute(&script).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

async fn serve(executor: SandboxExecutor, server: &ServerOverrides) -> Result<()> {
    let port = std::env::var("PORT").ok();
    let addr = bind_address(server, port.as_deref())?;

    #[cfg(feature = "metrics")]
    let router = {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(pyrun_sandbox::metrics::SandboxMetrics::new(&mut registry));
        let executor = executor.with_metrics(metrics);
        pyrun_server::router_with_metrics(Arc::new(executor), Arc::new(registry))
    };
    #[cfg(not(feature = "metrics"))]
    let router = pyrun_server::router(Arc::new(executor));

    pyrun_server::serve(addr, router)
        .await
        .with_context(|| format!("server on {addr} failed"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let sandbox_config = build_sandbox_config(&config.sandbox);
    tracing::info!(
        timeout_secs = sandbox_config.timeout.as_secs(),
        max_concurrent = sandbox_config.max_concurrent,
        isolation = ?sandbox_config.launcher.isolation,
        launcher = %sandbox_config.launcher.program,
        "sandbox configured"
    );

    let logger = audit_logger(&config.audit).await?;
    let executor = SandboxExecutor::with_audit_logger(sandbox_config, logger);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Run { script } => {
            if run_script(&executor, &script).await? {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Serve => {
            serve(executor, &config.server).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
