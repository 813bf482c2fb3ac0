/// Wrapped command lifecycle: when a command is given on the command line the
/// terminator runs it as a child and ties it to the shared shutdown token.
use crate::shutdown::{ShutdownToken, StopCause};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// How long the child gets between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum CommandError {
    /// The program could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    Wait { source: std::io::Error },
    /// The child exited unsuccessfully.
    Exited { code: i32, status: ExitStatus },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            CommandError::Wait { source } => write!(f, "failed to wait for command: {}", source),
            CommandError::Exited { status, .. } => write!(f, "{}", status),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { source, .. } => Some(source),
            CommandError::Wait { source } => Some(source),
            CommandError::Exited { .. } => None,
        }
    }
}

impl CommandError {
    /// Exit code the terminator itself should use.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Spawn { .. } => 127,
            CommandError::Wait { .. } => 1,
            CommandError::Exited { code, .. } => *code,
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(1)
}

/// Run `program` with inherited stdio until it exits or `token` fires.
///
/// On cancellation the child gets SIGTERM, then SIGKILL after `grace`.
pub async fn run_command(
    program: &str,
    args: &[String],
    token: &ShutdownToken,
    grace: Duration,
) -> Result<(), CommandError> {
    tracing::debug!(name = %program, ?args, "executing command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let status = tokio::select! {
        status = child.wait() => status.map_err(|source| CommandError::Wait { source })?,
        _ = token.cancelled() => {
            if let Some(pid) = child.id() {
                tracing::debug!(pid, "terminating command");
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::warn!(pid, error = %e, "failed to send SIGTERM");
                }
            }
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status.map_err(|source| CommandError::Wait { source })?,
                Err(_) => {
                    tracing::warn!("command ignored SIGTERM, killing");
                    child.kill().await.map_err(|source| CommandError::Wait { source })?;
                    child.wait().await.map_err(|source| CommandError::Wait { source })?
                }
            }
        }
    };

    tracing::debug!(%status, "command finished");
    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Exited {
            code: exit_code_of(status),
            status,
        })
    }
}

/// Run the wrapped command in the background.
///
/// Unless `keep_alive` is set, the command's exit stops the whole run.
pub fn spawn_supervised(
    program: String,
    args: Vec<String>,
    keep_alive: bool,
    token: ShutdownToken,
) -> tokio::task::JoinHandle<()> {
    tracing::debug!(command = %program, ?args, keep_alive, "running as wrapper");
    tokio::spawn(async move {
        let result = run_command(&program, &args, &token, TERMINATE_GRACE).await;
        if keep_alive {
            if let Err(e) = &result {
                tracing::warn!(error = %e, "exec command finished");
            }
            return;
        }
        let cause = match result {
            Ok(()) => StopCause::CommandFinished,
            Err(e) => StopCause::CommandFailed {
                exit_code: e.exit_code(),
                message: e.to_string(),
            },
        };
        token.cancel(cause);
    })
}
