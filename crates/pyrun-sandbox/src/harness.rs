//! Command lines for the two execution stages and the stage-2 wire format.
//!
//! Stage 1 runs the staged script as a program. Stage 2 runs [`DRIVER`], a
//! fixed Python program that imports the script as a module, calls the entry
//! function with stdout redirected to a buffer and prints exactly one line of
//! JSON: a [`HarnessEnvelope`].
//!
//! The driver never has anything interpolated into it. The staging directory,
//! module name and entry function name reach it as `sys.argv[1..=3]`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detect::ExecutionStrategy;
use crate::supervisor::CommandLine;

/// File name the submission is staged under.
pub const SCRIPT_FILE_NAME: &str = "user_script.py";

/// Module name the driver imports the submission as.
pub const MODULE_NAME: &str = "user_script";

/// The stage-2 driver program, passed to the interpreter with `-c`.
///
/// Module-level output of the submission is discarded so that only what the
/// entry function prints is reported. Import errors are not caught: they
/// surface as a traceback on stderr, which is a harness fault rather than a
/// script fault.
pub const DRIVER: &str = r#"import importlib
import io
import json
import sys

staging_dir, module_name, entry_name = sys.argv[1], sys.argv[2], sys.argv[3]
sys.path.insert(0, staging_dir)

real_stdout = sys.stdout
sys.stdout = io.StringIO()
try:
    module = importlib.import_module(module_name)
finally:
    sys.stdout = real_stdout

captured = io.StringIO()
sys.stdout = captured
try:
    result = getattr(module, entry_name)()
    sys.stdout = real_stdout
    line = json.dumps({"result": result, "stdout": captured.getvalue()}, allow_nan=False)
except BaseException as exc:
    sys.stdout = real_stdout
    line = json.dumps({"error": str(exc) or type(exc).__name__})
finally:
    sys.stdout = real_stdout

real_stdout.write(line + "\n")
real_stdout.flush()
"#;

/// Interpreter flag that disables writing `.pyc` files, keeping the staging
/// directory single-file.
const NO_BYTECODE: &str = "-B";

/// Stage 1: run the staged script as a standalone program, from its own
/// directory.
pub fn standalone_command(
    strategy: &ExecutionStrategy,
    script_path: &Path,
    timeout: Duration,
) -> CommandLine {
    let (program, args) = strategy.command_prefix(
        timeout,
        vec![
            NO_BYTECODE.to_string(),
            script_path.to_string_lossy().into_owned(),
        ],
    );
    CommandLine {
        program,
        args,
        working_dir: script_path.parent().map(Path::to_path_buf),
    }
}

/// Stage 2: run [`DRIVER`] against the staged module.
pub fn entry_command(
    strategy: &ExecutionStrategy,
    staging_dir: &Path,
    entry_function: &str,
    timeout: Duration,
) -> CommandLine {
    let (program, args) = strategy.command_prefix(
        timeout,
        vec![
            NO_BYTECODE.to_string(),
            "-c".to_string(),
            DRIVER.to_string(),
            staging_dir.to_string_lossy().into_owned(),
            MODULE_NAME.to_string(),
            entry_function.to_string(),
        ],
    );
    CommandLine {
        program,
        args,
        working_dir: Some(staging_dir.to_path_buf()),
    }
}

/// The single JSON line the driver prints on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HarnessEnvelope {
    /// The entry function raised, or its result could not be serialized.
    Failure {
        /// Exception message.
        error: String,
    },
    /// The entry function returned.
    Success {
        /// Return value.
        result: Value,
        /// Everything the entry function printed.
        stdout: String,
    },
}

/// Parse the driver's stdout into an envelope.
///
/// Surrounding whitespace is ignored; anything else besides the one JSON
/// object (extra lines, partial output) is an error.
pub fn parse_envelope(stdout: &str) -> Result<HarnessEnvelope, String> {
    let line = stdout.trim();
    if line.is_empty() {
        return Err("no output from harness".to_string());
    }
    serde_json::from_str(line).map_err(|e| e.to_string())
}
