//! Child-process supervision for both execution stages.
//!
//! [`ProcessSupervisor::run`] launches exactly one child, captures its stdout
//! and stderr, and enforces the time budget. Every failure mode (launch error,
//! timeout, crash) is reported inside the returned [`StageOutcome`]; nothing
//! propagates past this boundary.
//!
//! On Unix the child leads its own process group. Whatever it forked is killed
//! with it once the stage ends, whether it exited or ran out of time.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Exit code reported when the command could not be started at all.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = -1;

/// Default per-stream capture limit (1 MB).
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// How long output readers may keep draining after the child is gone.
/// Bounds the wait when a grandchild inherited the pipes.
const READ_GRACE: Duration = Duration::from_millis(500);

/// A program and its arguments, plus the directory to run it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable name or path.
    pub program: String,
    /// Arguments, not including the program.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
}

/// The observable result of running one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutcome {
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8), or the launch error.
    pub stderr: String,
    /// Exit code; `128 + signal` when killed by a signal,
    /// [`LAUNCH_FAILURE_EXIT_CODE`] when the launch failed.
    pub exit_code: i32,
    /// Whether the child was killed for exceeding its budget.
    pub timed_out: bool,
    /// Whether either stream exceeded the capture limit.
    pub truncated: bool,
    /// Wall time from launch to reaping.
    pub elapsed: Duration,
}

impl StageOutcome {
    fn launch_failure(detail: String, elapsed: Duration) -> Self {
        Self {
            stderr: detail,
            exit_code: LAUNCH_FAILURE_EXIT_CODE,
            elapsed,
            ..Default::default()
        }
    }

    /// Whether the command could not be started.
    pub fn launch_failed(&self) -> bool {
        !self.timed_out && self.exit_code == LAUNCH_FAILURE_EXIT_CODE
    }

    /// Whether the child ran to completion with exit code zero.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Launches and reaps child processes. Holds no per-execution state, so one
/// instance can serve any number of concurrent calls.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    max_output_size: usize,
    env: Vec<(String, String)>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_SIZE, Vec::new())
    }
}

impl ProcessSupervisor {
    /// Create a supervisor that captures up to `max_output_size` bytes per
    /// stream and gives children exactly `env` as their environment.
    pub fn new(max_output_size: usize, env: Vec<(String, String)>) -> Self {
        Self {
            max_output_size,
            env,
        }
    }

    /// Run `command` to completion or until `timeout` elapses.
    ///
    /// On timeout the child is killed and reaped before this returns, and the
    /// outcome carries whatever output had been captured so far.
    pub async fn run(&self, command: &CommandLine, timeout: Duration) -> StageOutcome {
        let started = Instant::now();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(program = %command.program, error = %e, "failed to launch child");
                return StageOutcome::launch_failure(
                    format!("failed to launch '{}': {}", command.program, e),
                    started.elapsed(),
                );
            }
        };

        let pgid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out = Capture::new(self.max_output_size);
        let mut err = Capture::new(self.max_output_size);
        let read_deadline = timeout + READ_GRACE;

        let (waited, _, _) = tokio::join!(
            wait_or_kill(&mut child, pgid, timeout),
            drain(stdout, &mut out, read_deadline),
            drain(stderr, &mut err, read_deadline),
        );

        let truncated = out.truncated || err.truncated;
        let mut stderr = err.into_string();
        if let Some(note) = waited.note {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&note);
        }

        let outcome = StageOutcome {
            truncated,
            stdout: out.into_string(),
            stderr,
            exit_code: waited.exit_code,
            timed_out: waited.timed_out,
            elapsed: started.elapsed(),
        };

        tracing::debug!(
            program = %command.program,
            exit_code = outcome.exit_code,
            timed_out = outcome.timed_out,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "child reaped"
        );

        outcome
    }
}

struct Waited {
    exit_code: i32,
    timed_out: bool,
    note: Option<String>,
}

async fn wait_or_kill(child: &mut Child, pgid: Option<u32>, timeout: Duration) -> Waited {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            // The leader is gone; background processes it left behind are not.
            kill_group(pgid);
            Waited {
                exit_code: exit_code(status),
                timed_out: false,
                note: None,
            }
        }
        Ok(Err(e)) => {
            // Could not observe the child; make sure it is gone anyway.
            kill_group(pgid);
            let _ = child.kill().await;
            Waited {
                exit_code: LAUNCH_FAILURE_EXIT_CODE,
                timed_out: false,
                note: Some(format!("failed to wait for child: {e}")),
            }
        }
        Err(_elapsed) => {
            kill_group(pgid);
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill timed-out child");
            }
            let exit_code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(_) => LAUNCH_FAILURE_EXIT_CODE,
            };
            Waited {
                exit_code,
                timed_out: true,
                note: None,
            }
        }
    }
}

/// SIGKILL every process in the child's group. The group id is the child's
/// pid, fixed at spawn by `process_group(0)`.
#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    LAUNCH_FAILURE_EXIT_CODE
}

/// Bounded output buffer. Bytes past the limit are read and dropped so the
/// child never blocks on a full pipe.
struct Capture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    async fn fill<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> std::io::Result<()> {
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            let room = self.limit.saturating_sub(self.buf.len());
            if n > room {
                self.truncated = true;
            }
            self.buf.extend_from_slice(&chunk[..n.min(room)]);
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, capture: &mut Capture, deadline: Duration) {
    let Some(reader) = reader else {
        return;
    };
    match tokio::time::timeout(deadline, capture.fill(reader)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "output pipe read failed"),
        Err(_) => tracing::debug!("output pipe still open after child exit, giving up"),
    }
}
