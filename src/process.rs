use std::{io, path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use tokio::{process::Command, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SpawnError;

/// Terminal report for one spawned process, delivered exactly once.
/// `terminated` distinguishes an exit provoked by `terminate`/`kill` from a
/// natural one; a spawn that never started surfaces as [`SpawnError`]
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub terminated: bool,
}

impl ProcessExit {
    pub fn clean(&self) -> bool {
        !self.terminated && self.code == Some(0)
    }
}

/// Capability view of one external OS process. Test doubles implement this
/// to simulate crashes and slow exits deterministically.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Suspends until the process has fully exited and been reaped.
    async fn wait(&self) -> ProcessExit;

    /// Requests graceful shutdown (SIGTERM on unix). Best effort; the
    /// process may ignore it.
    fn terminate(&self);

    /// Forces termination.
    fn kill(&self);
}

impl std::fmt::Debug for dyn ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<Arc<dyn ProcessHandle>, SpawnError>;
}

/// [`ProcessHandle`] over `tokio::process`. A single reaper task owns the
/// `Child`; terminate/kill are delivered to it through cancellation tokens
/// so no caller ever contends for the child itself.
pub struct TokioProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    term_token: CancellationToken,
    kill_token: CancellationToken,
}

impl TokioProcessHandle {
    fn spawn(
        executable: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<Self, SpawnError> {
        let mut command = Command::new(executable);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                SpawnError::NotFound(executable.to_string_lossy().to_string())
            }
            _ => SpawnError::Io(e.to_string()),
        })?;

        let pid = child.id();
        debug!(pid, executable = %executable.display(), "process spawned");

        let (exit_tx, exit_rx) = watch::channel(None);
        let term_token = CancellationToken::new();
        let kill_token = CancellationToken::new();

        let term = term_token.clone();
        let kill = kill_token.clone();
        tokio::spawn(async move {
            let mut term_sent = false;
            let mut kill_sent = false;
            let mut requested = false;

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = term.cancelled(), if !term_sent => {
                        term_sent = true;
                        requested = true;
                        signal_terminate(&child);
                    }
                    _ = kill.cancelled(), if !kill_sent => {
                        kill_sent = true;
                        requested = true;
                        if let Err(e) = child.start_kill() {
                            warn!(pid, error = %e, "kill request failed");
                        }
                    }
                }
            };

            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    terminated: requested,
                },
                Err(e) => {
                    warn!(pid, error = %e, "wait on child failed");
                    ProcessExit {
                        code: None,
                        terminated: requested,
                    }
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            pid,
            exit_rx,
            term_token,
            kill_token,
        })
    }
}

#[cfg(unix)]
fn signal_terminate(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &tokio::process::Child) {
    // No portable graceful signal; the kill path handles forced shutdown.
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Reaper dropped without reporting; treat as abnormal exit.
                return ProcessExit {
                    code: None,
                    terminated: false,
                };
            }
        }
    }

    fn terminate(&self) {
        self.term_token.cancel();
    }

    fn kill(&self) {
        self.kill_token.cancel();
    }
}

/// Default spawner backed by [`TokioProcessHandle`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(
        &self,
        executable: &Path,
        args: &[String],
        working_dir: &Path,
    ) -> Result<Arc<dyn ProcessHandle>, SpawnError> {
        Ok(Arc::new(TokioProcessHandle::spawn(
            executable,
            args,
            working_dir,
        )?))
    }
}
