#![warn(missing_docs)]

//! # pyrun-sandbox
//!
//! Validates a submitted Python script and runs its entry function in a
//! supervised child process, returning the JSON-serializable result together
//! with everything the function printed.
//!
//! ## Pipeline
//!
//! 1. **Static validation**: size, syntax, entry function with a `return`,
//!    denylisted terms. Rejected scripts are never executed.
//! 2. **Strategy detection**: wrap the interpreter in `nsjail` when it is
//!    installed, run it directly otherwise (reported as a warning).
//! 3. **Stage 1**: the script runs as a standalone program, surfacing hangs
//!    and module-level crashes under the real time budget.
//! 4. **Stage 2**: a fixed driver imports the script, calls the entry
//!    function with stdout captured and prints one JSON line.
//! 5. **Assembly**: both outcomes become one [`ExecutionResult`].
//!
//! ## Security model
//!
//! - **Isolation launcher** is the security boundary when present
//! - **Denylist** is defense-in-depth only, a substring heuristic
//! - **Fresh staging directory and fresh children per call**
//! - **Timeout enforcement**: children are killed and reaped
//! - **Minimal environment**: nothing from the host environment leaks in
//! - **Output size limits** on both captured streams

pub mod assembler;
pub mod ast_validator;
pub mod audit;
pub mod detect;
pub mod error;
pub mod executor;
pub mod harness;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod redact;
pub mod staging;
pub mod supervisor;
pub mod validator;

pub use assembler::{ExecutionOutput, ExecutionResult};
pub use detect::{ExecutionStrategy, IsolationMode, LauncherConfig};
pub use error::SandboxError;
pub use executor::{SandboxConfig, SandboxExecutor};
