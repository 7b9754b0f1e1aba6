//! Caller-owned process context
//!
//! Processes spawned through a [`ProcessContext`] are tracked until they are reaped.
//! [`ProcessContext::close_all`] terminates whatever is still alive: SIGTERM first,
//! then SIGKILL after a short grace period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{CommandIdentity, ProcessError, Result};
use crate::handle::ProcessHandle;
use crate::spec::ProcessSpec;

/// Grace period between SIGTERM and SIGKILL
pub const SIGKILL_TIMEOUT_MS: u64 = 200;

type Registry = Arc<Mutex<HashMap<u32, CommandIdentity>>>;

/// Tracks live processes so they can be torn down together
///
/// Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    live: Registry,
}

/// Entry held by a process handle until its exit is observed or the handle is dropped
///
/// Dropping the entry unregisters the pid. A dropped child is reaped by the runtime,
/// after which its pid may be reused, so it must not stay a `close_all` target.
#[derive(Debug)]
pub struct Registration {
    pid: u32,
    live: Registry,
}

impl Registration {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Forget the process; `close_all` will no longer signal it
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.live.lock().remove(&self.pid).is_some() {
            debug!(pid = %self.pid, "Unregistered process");
        }
    }
}

impl ProcessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a process tracked by this context
    ///
    /// # Examples
    /// ```no_run
    /// use ricepipe_process::{ProcessContext, ProcessSpec};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let context = ProcessContext::new();
    /// let _child = context.spawn(&ProcessSpec::new("sleep").arg("1000"))?;
    /// context.close_all().await;
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle> {
        ProcessHandle::spawn_in(spec, self)
    }

    /// Track a process spawned elsewhere until the returned entry is released
    ///
    /// Pid 0 names the caller's whole process group rather than one child and is
    /// rejected.
    pub fn register(&self, pid: u32, command: CommandIdentity) -> Result<Registration> {
        if pid == 0 {
            return Err(ProcessError::InvalidPid { command });
        }
        debug!(pid = %pid, command = %command, "Registering process");
        self.live.lock().insert(pid, command);
        Ok(Registration {
            pid,
            live: Arc::clone(&self.live),
        })
    }

    /// Number of processes not yet reaped
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// PIDs of processes not yet reaped
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.live.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Terminate every tracked process and forget it
    ///
    /// Returns how many processes were signalled.
    pub async fn close_all(&self) -> usize {
        let targets: Vec<(u32, CommandIdentity)> = self.live.lock().drain().collect();
        if targets.is_empty() {
            return 0;
        }

        info!(count = targets.len(), "Closing process context");
        let mut signalled = 0;
        for (pid, command) in &targets {
            if terminate(*pid) {
                debug!(pid = %pid, command = %command, "Sent SIGTERM");
                signalled += 1;
            }
        }

        if signalled > 0 {
            sleep(Duration::from_millis(SIGKILL_TIMEOUT_MS)).await;
            for (pid, _) in &targets {
                force_kill(*pid).await;
            }
        }
        signalled
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid = %pid, error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(unix)]
async fn force_kill(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pid = %pid, "Sent SIGKILL"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid = %pid, error = %e, "Failed to send SIGKILL"),
    }
}

#[cfg(windows)]
fn terminate(_pid: u32) -> bool {
    true
}

#[cfg(windows)]
async fn force_kill(pid: u32) {
    use tokio::process::Command;

    let status = Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/f", "/t"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!(pid = %pid, error = %e, "taskkill failed");
    }
}
