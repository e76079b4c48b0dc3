use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::{PhaseVerdict, VerdictStatus};

/// Guard that kills a child's process group on drop, so a panic or an
/// early return never leaves an orphaned subprocess behind. Shared with
/// the Line-Stream Multiplexer, which runs its own child under the same
/// termination policy.
pub(crate) struct ChildGuard {
    pid: u32,
    killed: AtomicBool,
}

impl ChildGuard {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            killed: AtomicBool::new(false),
        }
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            tracing::debug!("SIGTERM to pgid {} failed: {e}", self.pid);
        }
    }

    #[cfg(unix)]
    fn send_sigkill(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL).is_err() {
            // Group kill refused (e.g. we're not the group leader anymore);
            // fall back to killing just the leader, per SPEC_FULL.md §4.2.
            let _ = nix::sys::signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) {
        tracing::warn!("process termination not supported on this platform (pid={})", self.pid);
    }

    #[cfg(not(unix))]
    fn send_sigkill(&self) {}

    pub(crate) fn force_kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.send_sigkill();
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.force_kill();
    }
}

/// Accumulates combined stdout+stderr up to a byte cap (SPEC_FULL.md §4.2,
/// "Captured output... truncated to a bounded byte cap").
#[derive(Default)]
struct CapturedOutput {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CapturedOutput {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.buf.len() >= self.cap {
            self.truncated = true;
            return;
        }
        let remaining = self.cap - self.buf.len();
        if chunk.len() > remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    fn into_string(self) -> (String, bool) {
        (String::from_utf8_lossy(&self.buf).into_owned(), self.truncated)
    }
}

async fn drain_into(mut reader: impl tokio::io::AsyncRead + Unpin, sink: Arc<Mutex<CapturedOutput>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().await.push(&buf[..n]),
        }
    }
}

/// Wait for the child to exit within `grace`; if it doesn't, escalate to an
/// uninterruptible group kill. Implements SPEC_FULL.md §4.2's
/// graceful-then-forceful termination policy.
pub(crate) async fn terminate_guarded(guard: &ChildGuard, child: &mut Child, grace: Duration) -> bool {
    guard.send_sigterm();
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => false,
        Err(_) => {
            guard.force_kill();
            // Bounded wait to let the kernel finish reaping before we move on.
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            true
        }
    }
}

/// Runs one subprocess to completion under a wall-clock deadline and an
/// external cancellation token, returning a phase verdict.
///
/// `on_spawned` is called with the child's pid as soon as it is known, so
/// the caller can register it with the Admission Registry before awaiting
/// completion (SPEC_FULL.md §4.2, "reference to the Active-request record
/// so child handle attachment... is possible").
pub async fn run_supervised(
    argv: &[String],
    cwd: &Path,
    deadline: Duration,
    grace_period: Duration,
    output_cap: usize,
    cancel_token: &CancellationToken,
    on_spawned: impl FnOnce(u32),
) -> Result<PhaseVerdict> {
    if cancel_token.is_cancelled() {
        return Ok(PhaseVerdict::cancelled());
    }
    validate_cwd(cwd)?;

    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| Error::Other("empty argv".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    cmd.process_group(0);

    tracing::debug!(argv = ?argv, cwd = %cwd.display(), "spawning supervised subprocess");

    let mut child = cmd.spawn().map_err(Error::SpawnFailed)?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Other("failed to get child pid".into()))?;
    on_spawned(pid);
    let guard = ChildGuard::new(pid);

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let captured = Arc::new(Mutex::new(CapturedOutput::new(output_cap)));
    let stdout_task = tokio::spawn(drain_into(BufReader::new(stdout), captured.clone()));
    let stderr_task = tokio::spawn(drain_into(BufReader::new(stderr), captured.clone()));

    let verdict = tokio::select! {
        _ = cancel_token.cancelled() => {
            terminate_guarded(&guard, &mut child, grace_period).await;
            PhaseVerdict::cancelled()
        }
        _ = tokio::time::sleep(deadline) => {
            let forced = terminate_guarded(&guard, &mut child, grace_period).await;
            tracing::debug!(pid, forced, "subprocess deadline exceeded");
            PhaseVerdict {
                status: VerdictStatus::Timeout,
                exit_code: -1,
                message: "Timeout".to_string(),
                output: None,
                partial: false,
            }
        }
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => PhaseVerdict {
                    status: VerdictStatus::Pass,
                    exit_code: status.code().unwrap_or(0),
                    message: "ok".to_string(),
                    output: None,
                    partial: false,
                },
                Ok(status) => PhaseVerdict {
                    status: VerdictStatus::Fail,
                    exit_code: status.code().unwrap_or(-1),
                    message: format!("exited with status {status}"),
                    output: None,
                    partial: false,
                },
                Err(e) => PhaseVerdict {
                    status: VerdictStatus::Error,
                    exit_code: -1,
                    message: format!("failed to wait on child: {e}"),
                    output: None,
                    partial: false,
                },
            }
        }
    };

    // Give the drain tasks a short bounded window to flush whatever the
    // kernel still has buffered, then move on regardless.
    let _ = tokio::time::timeout(
        Duration::from_millis(500),
        futures::future::join(stdout_task, stderr_task),
    )
    .await;

    let (output, truncated) = Arc::try_unwrap(captured)
        .map(|m| m.into_inner())
        .unwrap_or_default()
        .into_string();

    let mut verdict = verdict;
    verdict.output = Some(output);
    if truncated && matches!(verdict.status, VerdictStatus::Fail | VerdictStatus::Pass) {
        verdict.message = format!("{} (output truncated)", verdict.message);
    }
    Ok(verdict)
}

/// Graceful-then-forceful termination of a process group the caller does
/// not otherwise hold a `Child` handle for — used by the cancel endpoint,
/// which acts on the bare pid recorded in the Admission Registry rather
/// than waiting on the pipeline worker's own `Child` (SPEC_FULL.md §9,
/// "using only the leaked process-group identifier").
pub async fn terminate_pid_group(pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        if killpg(Pid::from_raw(pid as i32), Signal::SIGTERM).is_err() {
            tracing::debug!(pid, "SIGTERM to pgid failed (already gone?)");
        }
        tokio::time::sleep(grace).await;
        if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_err() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
}

fn validate_cwd(cwd: &Path) -> Result<()> {
    if !cwd.exists() {
        return Err(Error::InvalidWorkDir(cwd.to_path_buf()));
    }
    if !cwd.is_dir() {
        return Err(Error::Other(format!(
            "working directory is not a directory: {}",
            cwd.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn successful_command_reports_pass() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let verdict = run_supervised(
            &["sh".into(), "-c".into(), "echo hi".into()],
            dir.path(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            4096,
            &token,
            |_pid| {},
        )
        .await
        .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Pass);
        assert!(verdict.output.unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_fail() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let verdict = run_supervised(
            &["sh".into(), "-c".into(), "exit 3".into()],
            dir.path(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            4096,
            &token,
            |_pid| {},
        )
        .await
        .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Fail);
        assert_eq!(verdict.exit_code, 3);
    }

    #[tokio::test]
    async fn deadline_exceeded_kills_and_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let verdict = run_supervised(
            &["sh".into(), "-c".into(), "sleep 30".into()],
            dir.path(),
            Duration::from_millis(200),
            Duration::from_millis(200),
            4096,
            &token,
            |_pid| {},
        )
        .await
        .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Timeout);
    }

    #[tokio::test]
    async fn pre_cancelled_token_prevents_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut spawned = false;
        let verdict = run_supervised(
            &["sh".into(), "-c".into(), "echo hi".into()],
            dir.path(),
            Duration::from_secs(5),
            Duration::from_secs(1),
            4096,
            &token,
            |_pid| spawned = true,
        )
        .await
        .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Cancelled);
        assert!(!spawned);
    }

    #[tokio::test]
    async fn cancellation_mid_run_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let token_for_cancel = token.clone();
        let handle = tokio::spawn(async move {
            run_supervised(
                &["sh".into(), "-c".into(), "sleep 30".into()],
                dir.path(),
                Duration::from_secs(30),
                Duration::from_millis(200),
                4096,
                &token,
                |_pid| {},
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token_for_cancel.cancel();
        let verdict = handle.await.unwrap().unwrap();
        assert_eq!(verdict.status, VerdictStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_working_directory_is_rejected() {
        let token = CancellationToken::new();
        let err = run_supervised(
            &["sh".into(), "-c".into(), "echo hi".into()],
            Path::new("/nonexistent/path/for/sure"),
            Duration::from_secs(5),
            Duration::from_secs(1),
            4096,
            &token,
            |_pid| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidWorkDir(_)));
    }
}
