//! Shared data types for srvmgr-executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::truncate::DEFAULT_MAX_BYTES;

/// Message recorded when a command exceeds its deadline.
pub const TIMEOUT_MESSAGE: &str = "execution timed out";

// ---------------------------------------------------------------------------
// ExecStatus
// ---------------------------------------------------------------------------

/// Terminal outcome of one command run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// The command exited with code 0.
    Success,
    /// Non-zero exit, signal, timeout or spawn failure.
    Failure,
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Result returned by `CommandExecutor::run`.
///
/// Never an `Err`: every way a command can go wrong is folded into a
/// `Failure` so callers can record it without special-casing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecStatus,

    /// `None` when the process never produced an exit code (timeout, signal,
    /// spawn failure).
    pub exit_code: Option<i32>,

    /// Captured standard output, bounded by `ExecOptions::max_output_bytes`.
    pub stdout: String,

    /// Captured standard error, bounded by `ExecOptions::max_output_bytes`.
    pub stderr: String,

    /// Set only for infrastructure failures. Never contains raw OS error text.
    pub error_message: Option<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,

    /// True when the deadline fired and the process group was terminated.
    pub timed_out: bool,

    /// OS process id of the shell, if it was spawned.
    pub pid: Option<u32>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Success
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    /// Build the result for a command that could not be started.
    pub(crate) fn spawn_failure(started_at: DateTime<Utc>, err: &std::io::Error) -> Self {
        let message = match err.kind() {
            std::io::ErrorKind::NotFound => "command interpreter not found",
            std::io::ErrorKind::PermissionDenied => "permission denied while starting command",
            _ => "failed to start command",
        };
        Self {
            status: ExecStatus::Failure,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error_message: Some(message.to_string()),
            started_at,
            ended_at: Utc::now(),
            timed_out: false,
            pid: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecOptions
// ---------------------------------------------------------------------------

/// Configuration knobs for command execution.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Shell binary used as `<shell> [-l] -c <command>`.
    pub shell: String,

    /// Pass `-l` so the user's login profile is sourced.
    pub login_shell: bool,

    /// Working directory. `None` inherits the daemon's cwd.
    pub working_dir: Option<PathBuf>,

    /// Per-stream capture budget in bytes.
    pub max_output_bytes: usize,

    /// Time between SIGTERM and SIGKILL on timeout.
    pub kill_grace: Duration,

    /// Remove ANSI escapes from captured output.
    pub strip_ansi: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            login_shell: false,
            working_dir: None,
            max_output_bytes: DEFAULT_MAX_BYTES,
            kill_grace: Duration::from_secs(5),
            strip_ansi: true,
        }
    }
}

impl From<&srvmgr_core::config::ExecutorConfig> for ExecOptions {
    fn from(config: &srvmgr_core::config::ExecutorConfig) -> Self {
        let working_dir = config
            .working_dir
            .clone()
            .or_else(|| std::env::var("HOME").ok())
            .map(PathBuf::from);
        Self {
            shell: config.shell.clone(),
            login_shell: config.login_shell,
            working_dir,
            max_output_bytes: config.max_output_bytes,
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            strip_ansi: true,
        }
    }
}
