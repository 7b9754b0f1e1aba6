//! Spawned process wrapper

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, info, warn};

use crate::context::{ProcessContext, Registration};
use crate::error::{CommandIdentity, ProcessError, Result, StreamRole};
use crate::guarded::{Guarded, ReleaseCounts, StderrReader, StdinWriter, StdoutReader};
use crate::output::{Feed, ProcessOutput};
use crate::spec::{PipeMode, ProcessSpec};
use crate::stderr::StderrPolicy;

/// How long `kill` waits for the child to be reaped
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code and terminating signal reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Code 0 and no signal
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// One stream slot of a process handle
#[derive(Debug)]
enum Slot<R> {
    NotPiped,
    Ready(Guarded<R>),
    Taken,
}

impl<R> Slot<R> {
    fn new(mode: PipeMode, raw: Option<R>, role: StreamRole, pid: u32, releases: &ReleaseCounts) -> Self {
        match (mode, raw) {
            (PipeMode::Piped, Some(raw)) => {
                Slot::Ready(Guarded::new(role, pid, raw, releases.clone()))
            }
            _ => Slot::NotPiped,
        }
    }

    fn take(&mut self, role: StreamRole, command: &CommandIdentity) -> Result<Guarded<R>> {
        match std::mem::replace(self, Slot::Taken) {
            Slot::Ready(guarded) => Ok(guarded),
            Slot::NotPiped => {
                *self = Slot::NotPiped;
                Err(ProcessError::NotPiped {
                    command: command.clone(),
                    role,
                })
            }
            Slot::Taken => Err(ProcessError::AlreadyTaken {
                command: command.clone(),
                role,
            }),
        }
    }
}

/// A running (or finished) child process and its three streams
///
/// Streams are handed out once each through `take_*`. Dropping the handle releases
/// every stream it still owns; it does not kill the child.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    command: CommandIdentity,
    stdin: Slot<ChildStdin>,
    stdout: Slot<ChildStdout>,
    stderr: Slot<ChildStderr>,
    exit: Option<ExitOutcome>,
    releases: ReleaseCounts,
    registration: Option<Registration>,
    closed: bool,
}

impl ProcessHandle {
    /// Launch the process described by `spec`
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        Self::launch(spec, None)
    }

    /// Launch and register the child with `context`
    pub fn spawn_in(spec: &ProcessSpec, context: &ProcessContext) -> Result<Self> {
        Self::launch(spec, Some(context))
    }

    fn launch(spec: &ProcessSpec, context: Option<&ProcessContext>) -> Result<Self> {
        let command = spec.identity();
        debug!(
            command = %command,
            stdin = %spec.stdin,
            stdout = %spec.stdout,
            stderr = %spec.stderr,
            "Spawning process"
        );

        let mut child = spec
            .to_command()
            .spawn()
            .map_err(|source| ProcessError::SpawnFailed {
                command: command.clone(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| ProcessError::InvalidPid {
            command: command.clone(),
        })?;
        let releases = ReleaseCounts::default();
        let stdin = Slot::new(spec.stdin, child.stdin.take(), StreamRole::Stdin, pid, &releases);
        let stdout = Slot::new(spec.stdout, child.stdout.take(), StreamRole::Stdout, pid, &releases);
        let stderr = Slot::new(spec.stderr, child.stderr.take(), StreamRole::Stderr, pid, &releases);
        let registration = context
            .map(|ctx| ctx.register(pid, command.clone()))
            .transpose()?;

        info!(pid = %pid, command = %command, "Process spawned");

        Ok(Self {
            child,
            pid,
            command,
            stdin,
            stdout,
            stderr,
            exit: None,
            releases,
            registration,
            closed: false,
        })
    }

    /// Get process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &CommandIdentity {
        &self.command
    }

    /// Release counters for the three streams
    pub fn release_counts(&self) -> ReleaseCounts {
        self.releases.clone()
    }

    /// Take the stdin writer; fails if stdin was not piped or is already taken
    pub fn take_stdin(&mut self) -> Result<StdinWriter> {
        self.stdin.take(StreamRole::Stdin, &self.command)
    }

    /// Take the stdout reader; fails if stdout was not piped or is already taken
    pub fn take_stdout(&mut self) -> Result<StdoutReader> {
        self.stdout.take(StreamRole::Stdout, &self.command)
    }

    /// Take the stderr reader; fails if stderr was not piped or is already taken
    pub fn take_stderr(&mut self) -> Result<StderrReader> {
        self.stderr.take(StreamRole::Stderr, &self.command)
    }

    /// Flush and close stdin if the handle still owns it
    ///
    /// Idempotent and infallible, so success, error and cancellation paths can all
    /// call it. Does not touch stdout/stderr and does not stop the child.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Slot::Ready(mut stdin) = std::mem::replace(&mut self.stdin, Slot::Taken) {
            if let Err(err) = stdin.shutdown().await {
                warn!(pid = %self.pid, error = %err, "Error closing stdin");
            }
        }
        debug!(pid = %self.pid, "Process handle closed");
    }

    /// Wait for the process to exit; the outcome is memoized
    pub async fn wait(&mut self) -> Result<ExitOutcome> {
        if let Some(outcome) = self.exit {
            return Ok(outcome);
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|source| ProcessError::WaitFailed {
                command: self.command.clone(),
                source,
            })?;
        Ok(self.record_exit(status))
    }

    /// Exit outcome if the process already finished, without waiting
    pub fn try_status(&mut self) -> Result<Option<ExitOutcome>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(self.record_exit(status))),
            Ok(None) => Ok(None),
            Err(source) => Err(ProcessError::WaitFailed {
                command: self.command.clone(),
                source,
            }),
        }
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_status(), Ok(None))
    }

    /// Kill the process and wait for it to be reaped
    pub async fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }

        debug!(pid = %self.pid, "Killing process");
        if let Err(e) = self.child.start_kill() {
            // Already exited between the check and the signal
            if self.is_running() {
                warn!(pid = %self.pid, error = %e, "Failed to kill process");
                return Err(ProcessError::KillFailed(e.to_string()));
            }
            return Ok(());
        }

        match tokio::time::timeout(KILL_WAIT_TIMEOUT, self.wait()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                warn!(pid = %self.pid, "Timeout waiting for killed process to exit");
                Err(ProcessError::KillFailed(format!(
                    "pid {} did not exit within {}s",
                    self.pid,
                    KILL_WAIT_TIMEOUT.as_secs()
                )))
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus) -> ExitOutcome {
        let outcome = ExitOutcome::from(status);
        self.exit = Some(outcome);
        if let Some(registration) = self.registration.take() {
            registration.release();
        }
        info!(
            pid = %self.pid,
            code = ?outcome.code,
            signal = ?outcome.signal,
            "Process exited"
        );
        outcome
    }

    /// Consume stdout as a chunk stream that also drives `feed`, drains stderr
    /// through `policy` and checks the exit status once stdout is exhausted
    pub fn into_output(
        mut self,
        feed: Option<Feed>,
        policy: StderrPolicy,
    ) -> Result<ProcessOutput> {
        let stdout = self.take_stdout()?;
        let stderr = match self.take_stderr() {
            Ok(reader) => Some(reader),
            Err(ProcessError::NotPiped { .. }) => None,
            Err(err) => return Err(err),
        };
        Ok(ProcessOutput::new(self, stdout, stderr, feed, policy))
    }
}
