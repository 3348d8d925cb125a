//! External processes driven by nodes: the idle-event source read by
//! `hcpub`, the per-event command run by `subpipe`, and the long-lived
//! renderer fed by `subdzen`. The idle source and the renderer are shell
//! strings; `subpipe` runs an argument vector as given.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Maximum captured stderr reported for a failed command.
const MAX_STDERR: usize = 4096;

/// How long a renderer gets to exit after its input closes.
const RENDERER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed writing to `{command}`: {source}")]
    Write {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// A shell command, run through `sh -c` (`cmd /C` on Windows).
fn shell(command: &str) -> Command {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.kill_on_drop(true);
    cmd
}

// ─── Idle-event source ────────────────────────────────────────────────────────

/// A child process whose stdout is consumed line by line.
pub struct LineSource {
    command: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl LineSource {
    pub fn spawn(command: &str) -> Result<Self, ProcessError> {
        let mut child = shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.to_string(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| ProcessError::Spawn {
            command: command.to_string(),
            source: std::io::Error::other("stdout not captured"),
        })?;
        info!("Started `{command}`");
        Ok(Self {
            command: command.to_string(),
            child,
            lines: BufReader::new(stdout).lines(),
        })
    }

    /// Next line, `None` once the process closes its output. Cancel-safe.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Kill the process if still running and report how it ended.
    pub async fn finish(mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                warn!("`{}` exited with {status}", self.command)
            }
            Ok(Some(_)) => debug!("`{}` exited", self.command),
            Ok(None) => {
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to stop `{}`: {e}", self.command);
                }
            }
            Err(e) => warn!("Cannot query `{}`: {e}", self.command),
        }
    }
}

// ─── One-shot command ─────────────────────────────────────────────────────────

/// Run `argv` directly (no shell) with `input` on its stdin and wait for it
/// to exit. Each element reaches the program as one argument.
pub async fn run_with_input(argv: &[String], input: &str) -> Result<(), ProcessError> {
    let command = argv.join(" ");
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcessError::Spawn {
            command,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };
    let mut child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let write = async {
            stdin.write_all(input.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await
        };
        // A command that ignores its input may close stdin early.
        if let Err(e) = write.await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(ProcessError::Write {
                    command: command.clone(),
                    source: e,
                });
            }
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ProcessError::Write {
            command: command.clone(),
            source,
        })?;
    if output.status.success() {
        return Ok(());
    }
    let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.len() > MAX_STDERR {
        let cut = (0..=MAX_STDERR).rev().find(|i| stderr.is_char_boundary(*i)).unwrap_or(0);
        stderr.truncate(cut);
    }
    Err(ProcessError::Failed {
        command,
        status: output.status,
        stderr,
    })
}

// ─── Long-lived renderer ──────────────────────────────────────────────────────

/// A renderer process started once and fed one line per update.
///
/// Dropping the handle kills the process; [`Renderer::shutdown`] closes its
/// input first so it can exit on its own.
pub struct Renderer {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl Renderer {
    pub fn spawn(command: &str) -> Result<Self, ProcessError> {
        let mut child = shell(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.to_string(),
                source,
            })?;
        let stdin = child.stdin.take();
        info!("Renderer started: `{command}`");
        Ok(Self {
            command: command.to_string(),
            child,
            stdin,
        })
    }

    /// Write one display line and flush it so the renderer redraws now.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProcessError> {
        let command = &self.command;
        let stdin = self.stdin.as_mut().ok_or_else(|| ProcessError::Write {
            command: command.clone(),
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        })?;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|source| ProcessError::Write {
            command: command.clone(),
            source,
        })
    }

    /// Whether the renderer has exited on its own.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    pub async fn shutdown(mut self) {
        drop(self.stdin.take());
        match tokio::time::timeout(RENDERER_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Renderer `{}` exited with {status}", self.command),
            Ok(Err(e)) => warn!("Renderer `{}` wait failed: {e}", self.command),
            Err(_) => {
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill renderer `{}`: {e}", self.command);
                }
            }
        }
        info!("Renderer stopped: `{}`", self.command);
    }
}
