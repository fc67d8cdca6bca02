//! Process helpers shared across the workspace.
//!
//! [`run_captured`] is the one place external tools are launched: it spawns a
//! single child, collects its stderr, and either waits for the exit status or
//! kills the child as soon as the supplied token is cancelled.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Upper bound on the stderr text kept for diagnostics.
const MAX_STDERR_BYTES: u64 = 64 * 1024;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

impl NoWindowExt for Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.no_window();
    cmd
}

/// Failure to run a process at all (as opposed to the process failing).
#[derive(Debug, Error)]
pub enum RunError {
    /// The executable could not be located.
    #[error("{program} not found")]
    NotFound { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Exit status of a finished child plus whatever it wrote to stderr.
#[derive(Debug)]
pub struct CapturedExit {
    pub status: ExitStatus,
    pub stderr: String,
}

impl CapturedExit {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Text describing a failed run: the captured stderr, or the exit code when
    /// the tool wrote nothing.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.status.code() {
            Some(code) => format!("Exit code: {}", code),
            None => "Process terminated abnormally".to_string(),
        }
    }
}

/// How a [`run_captured`] call ended.
#[derive(Debug)]
pub enum RunOutcome {
    Exited(CapturedExit),
    /// The token fired; the child was killed without waiting for a graceful exit.
    Cancelled,
}

/// Spawn `cmd`, capture its stderr and wait for it to exit.
///
/// stdin and stdout are detached. If `cancel` fires first the child is killed
/// and [`RunOutcome::Cancelled`] is returned.
pub async fn run_captured(
    cmd: &mut Command,
    cancel: &CancellationToken,
) -> Result<RunOutcome, RunError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if cancel.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }

    let mut child = cmd.spawn().map_err(|source| match source.kind() {
        std::io::ErrorKind::NotFound => RunError::NotFound {
            program: program.clone(),
        },
        _ => RunError::Spawn {
            program: program.clone(),
            source,
        },
    })?;

    debug!(program = %program, pid = ?child.id(), "Spawned process");

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = (&mut stderr)
                .take(MAX_STDERR_BYTES)
                .read_to_end(&mut buf)
                .await;
            // keep draining so a chatty child never blocks on a full pipe
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(program = %program, error = %e, "Failed to kill cancelled process");
            }
            if let Some(reader) = stderr_reader {
                reader.abort();
            }
            debug!(program = %program, "Process killed on cancellation");
            Ok(RunOutcome::Cancelled)
        }
        status = child.wait() => {
            let status = status.map_err(|source| RunError::Wait {
                program: program.clone(),
                source,
            })?;
            let stderr = match stderr_reader {
                Some(reader) => reader.await.unwrap_or_default(),
                None => String::new(),
            };
            if !status.success() {
                warn!(program = %program, code = ?status.code(), "Process exited unsuccessfully");
            }
            Ok(RunOutcome::Exited(CapturedExit { status, stderr }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let mut cmd = tokio_command("media-curator-definitely-missing-tool");
        let token = CancellationToken::new();

        let err = run_captured(&mut cmd, &token).await.unwrap_err();
        assert!(matches!(err, RunError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_precancelled_token_never_spawns() {
        let mut cmd = tokio_command("media-curator-definitely-missing-tool");
        let token = CancellationToken::new();
        token.cancel();

        let outcome = run_captured(&mut cmd, &token).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_captures_stderr() {
        let mut cmd = tokio_command("sh");
        cmd.args(["-c", "echo 'invalid filter graph' >&2; exit 3"]);
        let token = CancellationToken::new();

        let outcome = run_captured(&mut cmd, &token).await.unwrap();
        let RunOutcome::Exited(exit) = outcome else {
            panic!("expected exit");
        };
        assert!(!exit.success());
        assert_eq!(exit.code(), Some(3));
        assert_eq!(exit.diagnostic(), "invalid filter graph");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_failure_reports_exit_code() {
        let mut cmd = tokio_command("sh");
        cmd.args(["-c", "exit 4"]);
        let token = CancellationToken::new();

        let RunOutcome::Exited(exit) = run_captured(&mut cmd, &token).await.unwrap() else {
            panic!("expected exit");
        };
        assert_eq!(exit.diagnostic(), "Exit code: 4");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let mut cmd = tokio_command("sleep");
        cmd.arg("30");
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), run_captured(&mut cmd, &token))
            .await
            .expect("cancellation should not wait for the child")
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled));
    }
}
