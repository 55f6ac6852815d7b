//! `CommandExecutor`: runs one shell command to completion or timeout.
//!
//! The executor is stateless apart from its options, so a single instance is
//! shared (behind an `Arc` or by clone) by every scheduler worker. It only
//! suspends the calling task; nothing here blocks the Tokio runtime.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    truncate::CaptureBuffer,
    types::{ExecOptions, ExecStatus, ExecutionResult, TIMEOUT_MESSAGE},
};

/// How long to wait for the output readers after the process is gone.
///
/// A detached grandchild that escaped the process group can keep a pipe open
/// forever; after this we keep whatever was captured.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type SharedCapture = Arc<Mutex<CaptureBuffer>>;

/// How the wait for the child ended.
enum Exit {
    Exited(ExitStatus),
    WaitFailed,
    TimedOut,
}

#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    options: ExecOptions,
}

impl CommandExecutor {
    pub fn new(options: ExecOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    /// Run `command` through the configured shell with a `timeout_secs` deadline.
    ///
    /// On timeout the whole process group receives SIGTERM, then SIGKILL after
    /// the grace period. A timeout of 0 is treated as 1 second.
    pub async fn run(&self, command: &str, timeout_secs: u64) -> ExecutionResult {
        let started_at = Utc::now();
        let timeout = Duration::from_secs(timeout_secs.max(1));

        let mut child = match self.build_command(command).spawn() {
            Ok(child) => child,
            Err(e) => {
                // The raw error can name host paths; it stays in the log only.
                warn!(shell = %self.options.shell, error = %e, "failed to spawn command");
                return ExecutionResult::spawn_failure(started_at, &e);
            }
        };

        let pid = child.id();
        debug!(?pid, timeout_secs, "command spawned");

        let limit = self.options.max_output_bytes;
        let stdout_buf: SharedCapture = Arc::new(Mutex::new(CaptureBuffer::new(limit)));
        let stderr_buf: SharedCapture = Arc::new(Mutex::new(CaptureBuffer::new(limit)));
        let stdout_reader = child
            .stdout
            .take()
            .map(|s| tokio::spawn(capture(s, Arc::clone(&stdout_buf))));
        let stderr_reader = child
            .stderr
            .take()
            .map(|s| tokio::spawn(capture(s, Arc::clone(&stderr_buf))));

        let exit = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Exit::Exited(status),
            Ok(Err(e)) => {
                warn!(?pid, error = %e, "waiting for command failed");
                self.terminate(&mut child, pid).await;
                Exit::WaitFailed
            }
            Err(_elapsed) => {
                info!(?pid, timeout_secs, "command exceeded its deadline, terminating");
                self.terminate(&mut child, pid).await;
                Exit::TimedOut
            }
        };

        drain(stdout_reader).await;
        drain(stderr_reader).await;

        let strip = self.options.strip_ansi;
        let stdout = render(&stdout_buf, strip);
        let stderr = render(&stderr_buf, strip);
        let ended_at = Utc::now();

        let (status, exit_code, error_message, timed_out) = match exit {
            Exit::Exited(status) => match status.code() {
                Some(0) => (ExecStatus::Success, Some(0), None, false),
                Some(code) => (ExecStatus::Failure, Some(code), None, false),
                None => (
                    ExecStatus::Failure,
                    None,
                    Some(describe_signal(&status)),
                    false,
                ),
            },
            Exit::WaitFailed => (
                ExecStatus::Failure,
                None,
                Some("failed to wait for command".to_string()),
                false,
            ),
            Exit::TimedOut => (
                ExecStatus::Failure,
                None,
                Some(TIMEOUT_MESSAGE.to_string()),
                true,
            ),
        };

        ExecutionResult {
            status,
            exit_code,
            stdout,
            stderr,
            error_message,
            started_at,
            ended_at,
            timed_out,
            pid,
        }
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.options.shell);
        if self.options.login_shell {
            cmd.arg("-l");
        }
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.options.working_dir {
            cmd.current_dir(dir);
        }
        // Own process group so a timeout reaches everything the script started.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// SIGTERM the process group, wait the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGTERM);
                if tokio::time::timeout(self.options.kill_grace, child.wait())
                    .await
                    .is_err()
                {
                    warn!(pid, "command ignored SIGTERM, sending SIGKILL");
                }
                // Also catches stragglers when the leader exited but its children did not.
                signal_group(pid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        if let Err(e) = child.kill().await {
            debug!(error = %e, "kill after timeout failed (process already gone?)");
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // Safety: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group created for our child by `process_group(0)`.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        debug!(
            pid,
            signal,
            error = %std::io::Error::last_os_error(),
            "signalling process group failed"
        );
    }
}

#[cfg(unix)]
fn describe_signal(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {sig}"),
        None => "terminated without exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal(_status: &ExitStatus) -> String {
    "terminated without exit code".to_string()
}

/// Pump a child pipe into the shared capture buffer until EOF.
async fn capture<R>(mut stream: R, buf: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut guard = buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.push(&chunk[..n]);
            }
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

async fn drain(reader: Option<JoinHandle<()>>) {
    let Some(mut handle) = reader else {
        return;
    };
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut handle)
        .await
        .is_err()
    {
        debug!("output pipe still open after exit, keeping partial capture");
        handle.abort();
    }
}

fn render(buf: &SharedCapture, strip_ansi: bool) -> String {
    buf.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .render(strip_ansi)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
