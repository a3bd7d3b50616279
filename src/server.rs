/// Server process lifecycle: spawn the static file server, drain its stderr,
/// and stop it exactly once no matter who asks.
use crate::failure::ServerError;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;

/// Upper bound on stderr bytes kept for failure classification.
const MAX_CAPTURED_STDERR: usize = 64 * 1024;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lifecycle of the server process. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminated,
}

/// External command that serves a directory on a port.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ServerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build the argument list, replacing `{port}` placeholders with the port number.
    fn build_args(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", &port))
            .collect()
    }

    /// Human-readable command line, for logs.
    pub fn command_line(&self, port: u16) -> String {
        std::iter::once(self.program.clone())
            .chain(self.build_args(port))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for ServerCommand {
    fn default() -> Self {
        Self::new(
            "python3",
            vec![
                "-m".to_string(),
                "http.server".to_string(),
                "{port}".to_string(),
            ],
        )
    }
}

enum Slot {
    NotStarted,
    Running { pid: Pid },
    Terminated,
}

struct Inner {
    command: ServerCommand,
    directory: PathBuf,
    port: u16,
    grace_period: Duration,
    slot: Mutex<Slot>,
    exited: watch::Sender<bool>,
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_exited(&self) {
        *self.lock_slot() = Slot::Terminated;
        self.exited.send_replace(true);
    }
}

/// Marks the handle terminated when the owning `start` call ends, however it ends.
struct Reaped<'a>(&'a Inner);

impl Drop for Reaped<'_> {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

/// Shared handle to one server process. Clones refer to the same process.
#[derive(Clone)]
pub struct ServerProcess {
    inner: Arc<Inner>,
}

impl ServerProcess {
    pub fn new(
        command: ServerCommand,
        directory: impl Into<PathBuf>,
        port: u16,
        grace_period: Duration,
    ) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                command,
                directory: directory.into(),
                port,
                grace_period,
                slot: Mutex::new(Slot::NotStarted),
                exited,
            }),
        }
    }

    pub fn state(&self) -> ProcessState {
        match *self.inner.lock_slot() {
            Slot::NotStarted => ProcessState::NotStarted,
            Slot::Running { .. } => ProcessState::Running,
            Slot::Terminated => ProcessState::Terminated,
        }
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Pid of the running server (also its process group id).
    pub fn pid(&self) -> Option<u32> {
        match *self.inner.lock_slot() {
            Slot::Running { pid } => u32::try_from(pid.as_raw()).ok(),
            _ => None,
        }
    }

    /// Launch the server and wait until it exits.
    ///
    /// Returns `Ok(())` when the process stopped because `terminate` was called
    /// (or was called before launch). Any exit the server makes on its own is
    /// an error, classified from its stderr.
    pub async fn start(&self) -> Result<(), ServerError> {
        let inner = &*self.inner;
        let args = inner.command.build_args(inner.port);

        let (mut child, pid) = {
            let mut slot = inner.lock_slot();
            match *slot {
                Slot::NotStarted => {}
                Slot::Terminated => {
                    tracing::debug!("server terminated before launch, not starting");
                    return Ok(());
                }
                Slot::Running { .. } => return Err(ServerError::AlreadyStarted),
            }

            tracing::info!(
                command = %inner.command.program,
                args = ?args,
                dir = %inner.directory.display(),
                "spawning server"
            );

            let spawned = Command::new(&inner.command.program)
                .args(&args)
                .current_dir(&inner.directory)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .process_group(0) // New process group for clean kill
                .kill_on_drop(true)
                .spawn();

            let child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    *slot = Slot::Terminated;
                    drop(slot);
                    inner.exited.send_replace(true);
                    return Err(ServerError::Launch {
                        program: inner.command.program.clone(),
                        source: e,
                    });
                }
            };

            let raw = child.id().and_then(|id| i32::try_from(id).ok()).unwrap_or(0);
            let pid = Pid::from_raw(raw);
            *slot = Slot::Running { pid };
            (child, pid)
        };
        let _reaped = Reaped(inner);

        tracing::info!(pid = pid.as_raw(), "server started");
        let capture = tokio::spawn(capture_stderr(child.stderr.take()));

        let status = child.wait().await;

        // Terminated here means terminate() got in first; Running means the server quit on its own.
        let requested = {
            let mut slot = inner.lock_slot();
            let requested = matches!(*slot, Slot::Terminated);
            *slot = Slot::Terminated;
            requested
        };

        // The leader is gone but anything it forked is still in its group,
        // possibly holding stderr open.
        self.stop_group(pid).await;
        let stderr = match tokio::time::timeout(inner.grace_period, capture).await {
            Ok(captured) => captured.unwrap_or_default(),
            Err(_) => {
                tracing::warn!(pid = pid.as_raw(), "server stderr still open after its group exited");
                String::new()
            }
        };
        let status = status.map_err(|e| ServerError::Wait { source: e })?;

        if requested {
            tracing::info!(pid = pid.as_raw(), %status, "server stopped");
            return Ok(());
        }

        tracing::warn!(pid = pid.as_raw(), %status, "server exited on its own");
        Err(ServerError::classify(&stderr, status, inner.port))
    }

    /// Stop the server and wait for it to be reaped.
    ///
    /// Safe to call any number of times, from any task, before, during, or
    /// after `start`. Only the first call signals the process; later calls
    /// just wait for the exit the first one caused.
    pub async fn terminate(&self) {
        let inner = &*self.inner;
        let pid = {
            let mut slot = inner.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Terminated) {
                Slot::NotStarted => {
                    drop(slot);
                    tracing::debug!("terminate before launch");
                    inner.exited.send_replace(true);
                    return;
                }
                Slot::Terminated => None,
                Slot::Running { pid } => Some(pid),
            }
        };

        if let Some(pid) = pid {
            tracing::info!(pid = pid.as_raw(), "stopping server");
            signal_group(pid, Signal::SIGTERM);

            if tokio::time::timeout(inner.grace_period, self.wait_exited())
                .await
                .is_ok()
            {
                return;
            }

            tracing::warn!(
                pid = pid.as_raw(),
                grace_ms = inner.grace_period.as_millis() as u64,
                "server ignored SIGTERM, killing"
            );
            signal_group(pid, Signal::SIGKILL);
        }

        self.wait_exited().await;
    }

    /// SIGTERM whatever is left of the server's process group, then SIGKILL
    /// it if it is still there after the grace period.
    async fn stop_group(&self, pid: Pid) {
        if !group_exists(pid) {
            return;
        }
        tracing::debug!(pid = pid.as_raw(), "stopping leftover server processes");
        signal_group(pid, Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + self.inner.grace_period;
        while group_exists(pid) {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(pid = pid.as_raw(), "leftover server processes ignored SIGTERM, killing");
                signal_group(pid, Signal::SIGKILL);
                return;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }

    async fn wait_exited(&self) {
        let mut exited = self.inner.exited.subscribe();
        // The sender lives in `inner`, which we hold, so this only ends once marked.
        let _ = exited.wait_for(|done| *done).await;
    }
}

fn signal_group(pid: Pid, signal: Signal) {
    // Group 0 would be our own.
    if pid.as_raw() <= 0 {
        return;
    }
    match killpg(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid = pid.as_raw(), ?signal, error = %e, "failed to signal server"),
    }
}

fn group_exists(pid: Pid) -> bool {
    if pid.as_raw() <= 0 {
        return false;
    }
    !matches!(killpg(pid, None), Err(Errno::ESRCH))
}

/// Drain the server's stderr until it closes, keeping a bounded prefix.
async fn capture_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };

    let mut lines = BufReader::new(stderr).lines();
    let mut captured = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(target: "preview_server::server::stderr", "{line}");
                if captured.len() + line.len() < MAX_CAPTURED_STDERR {
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "stopped reading server stderr");
                break;
            }
        }
    }
    captured
}
