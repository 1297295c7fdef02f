use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::transport::TransportError;

/// Handle to one worker OS process.
///
/// Liveness and exit status are queried directly from the handle, never from
/// an external process table. `try_wait` caches the exit status, so the
/// queries stay valid after the process disappears.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Wrap a spawned child.
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    /// OS process id, if the process ever started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code, once the process has exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait(&mut self, timeout: Duration) -> Option<ExitStatus> {
        tokio::time::timeout(timeout, self.child.wait())
            .await
            .ok()
            .and_then(Result::ok)
    }

    /// Force-kill the process and reap it.
    pub async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(pid = ?self.pid, error = %err, "kill on worker process failed");
        }
    }

    /// Ask the process to exit, escalating to a kill after `grace`.
    ///
    /// On unix this sends SIGTERM first; elsewhere it kills immediately.
    pub async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        {
            if self.is_alive() {
                if let Some(pid) = self.pid {
                    let pid = nix::unistd::Pid::from_raw(pid as i32);
                    match nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                        Ok(()) => {
                            if self.wait(grace).await.is_some() {
                                return;
                            }
                            warn!(pid = %pid, "worker ignored SIGTERM, killing");
                        }
                        Err(nix::errno::Errno::ESRCH) => return,
                        Err(err) => {
                            warn!(pid = %pid, error = %err, "failed to signal worker");
                        }
                    }
                }
            }
        }
        #[cfg(not(unix))]
        let _ = grace;
        self.kill().await;
    }
}

/// Spawns worker processes from a program and fixed arguments.
///
/// By default workers re-run the host's own executable; the host signals the
/// worker role through the environment and routes into the worker entry point
/// before doing anything else in `main`.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerLauncher {
    /// Launch workers by re-running the current executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: Vec::new(),
        })
    }

    /// Launch workers with an explicit program and arguments.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self { program: program.into(), args }
    }

    /// Spawn one worker with the given extra environment.
    ///
    /// stdin/stdout carry the wire protocol; stderr is inherited so worker
    /// logs land next to the controller's. The child dies with the
    /// controller: `kill_on_drop` stands in for daemonized workers.
    pub(crate) fn spawn(&self, envs: &[(&str, String)]) -> Result<SpawnedProcess, TransportError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in envs {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|err| TransportError::Spawn(format!("{}: {err}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("worker stdout not captured".into()))?;

        Ok(SpawnedProcess {
            handle: ProcessHandle::new(child),
            stdin,
            stdout,
        })
    }
}

/// A freshly spawned worker process with its wire channels.
pub(crate) struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}
