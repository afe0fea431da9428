//! Detached child-process launching and termination.
//!
//! Children are spawned in their own session/process group with stdout and
//! stderr redirected to the spool's artifact files and stdin detached, so
//! they survive a supervisor restart. The launcher never waits on a child:
//! it records the pid and returns. Handles of children spawned by this
//! process are retained so exited children are reaped promptly via
//! `try_wait`; children inherited from a previous supervisor process are
//! probed with a zero signal.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Errors from launching or signalling children.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Empty argv.
    #[error("empty command")]
    EmptyCommand,

    /// The spawn itself failed (binary missing, fork failure).
    #[error("failed to spawn '{binary}': {source}")]
    Spawn {
        /// The binary that could not be started.
        binary: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Could not open an output sink.
    #[error("failed to open output sink: {0}")]
    Sink(#[from] std::io::Error),

    /// The kernel did not report a pid for the spawned child.
    #[error("spawned child has no pid")]
    NoPid,
}

/// Observed state of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// The process is alive.
    Alive,
    /// The process has exited; the code is known only for children
    /// spawned by this supervisor process.
    Exited(Option<i32>),
}

/// Spawns and signals detached children.
#[derive(Debug, Default)]
pub struct Launcher {
    children: Mutex<HashMap<String, Child>>,
}

impl Launcher {
    /// Create an empty launcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `argv` detached in `cwd`, redirecting output to the given
    /// sinks. Returns the child's pid immediately without waiting.
    pub fn spawn_detached(
        &self,
        spool_id: &str,
        argv: &[String],
        cwd: &Path,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<u32, LaunchError> {
        let (binary, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;

        let stdout = File::create(stdout_path)?;
        let stderr = File::create(stderr_path)?;

        let mut command = Command::new(binary);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(false);

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        let pid = child.id().ok_or(LaunchError::NoPid)?;

        self.children
            .lock()
            .expect("launcher registry poisoned")
            .insert(spool_id.to_string(), child);

        tracing::debug!(spool_id, pid, binary = %binary, "spawned detached child");
        Ok(pid)
    }

    /// Observe a child's state, reaping it if it was ours and has exited.
    #[must_use]
    pub fn probe(&self, spool_id: &str, pid: u32) -> ChildState {
        let mut children = self.children.lock().expect("launcher registry poisoned");
        if let Some(child) = children.get_mut(spool_id) {
            match child.try_wait() {
                Ok(Some(status)) => {
                    children.remove(spool_id);
                    ChildState::Exited(status.code())
                }
                Ok(None) => ChildState::Alive,
                Err(_) => {
                    children.remove(spool_id);
                    ChildState::Exited(None)
                }
            }
        } else if pid_alive(pid) {
            ChildState::Alive
        } else {
            ChildState::Exited(None)
        }
    }

    /// Drop a spool's child handle without signalling it (used when a
    /// fallback respawn replaces the child).
    pub fn forget(&self, spool_id: &str) {
        self.children
            .lock()
            .expect("launcher registry poisoned")
            .remove(spool_id);
    }

    /// Ask a child's process group to stop (SIGTERM only). The monitor's
    /// next pass finishes the job.
    pub fn request_stop(&self, pid: u32) {
        if pid > 0 {
            signal_group(pid, Signal::SIGTERM);
        }
    }

    /// Terminate a child's process group: SIGTERM, a grace window, then
    /// SIGKILL if it is still alive.
    pub async fn terminate(&self, pid: u32, grace: Duration) {
        if pid == 0 {
            return;
        }
        signal_group(pid, Signal::SIGTERM);
        tokio::time::sleep(grace).await;
        if pid_alive(pid) {
            signal_group(pid, Signal::SIGKILL);
        }
    }
}

/// Whether a pid exists (zero-signal probe). Zombies count as alive; the
/// registry path reaps our own children before this is consulted.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Command line of a pid, when the host exposes `/proc`.
#[must_use]
pub fn pid_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let joined = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn signal_group(pid: u32, signal: Signal) {
    let pgid = Pid::from_raw(pid as i32);
    if killpg(pgid, signal).is_err() {
        // Not a group leader we own; try the single process.
        let _ = kill(Pid::from_raw(pid as i32), signal);
    }
}
