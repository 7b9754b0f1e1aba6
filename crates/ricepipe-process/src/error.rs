//! Error types for process management

use std::fmt;
use std::io;

use thiserror::Error;

/// Boxed error used as a chained cause
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Program and arguments of a spawned command, for error messages and logs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandIdentity {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandIdentity {
    pub fn new(program: impl Into<String>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
        }
    }
}

impl fmt::Display for CommandIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// One of the three standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamRole {
    pub(crate) fn index(self) -> usize {
        match self {
            StreamRole::Stdin => 0,
            StreamRole::Stdout => 1,
            StreamRole::Stderr => 2,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamRole::Stdin => "stdin",
            StreamRole::Stdout => "stdout",
            StreamRole::Stderr => "stderr",
        })
    }
}

fn diagnostics(stderr: &Option<String>) -> String {
    match stderr {
        Some(text) if !text.trim().is_empty() => format!("\nstderr:\n{}", text.trim_end()),
        _ => String::new(),
    }
}

/// Process management errors
///
/// `ExitStatus`, `Signal` and `Stream` are only produced while consuming a
/// process's stdout; callers match on them but never build them.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Failed to spawn process
    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: CommandIdentity,
        #[source]
        source: io::Error,
    },

    /// Process completed with a non-zero exit code
    #[error("`{command}` exited with code {code}{}", diagnostics(.stderr))]
    ExitStatus {
        command: CommandIdentity,
        code: i32,
        stderr: Option<String>,
        #[source]
        cause: Option<BoxError>,
    },

    /// Process was terminated by a signal before completing
    #[error("`{command}` was terminated by signal {signal}{}", diagnostics(.stderr))]
    Signal {
        command: CommandIdentity,
        signal: i32,
        stderr: Option<String>,
        #[source]
        cause: Option<BoxError>,
    },

    /// Fault while relaying bytes to or from the process
    #[error("Stream fault while relaying `{command}`: {cause}")]
    Stream {
        command: CommandIdentity,
        #[source]
        cause: BoxError,
    },

    /// Stream accessor used on a stream that was not piped at spawn time
    #[error("{role} of `{command}` was not piped at spawn time")]
    NotPiped {
        command: CommandIdentity,
        role: StreamRole,
    },

    /// Stream accessor used twice
    #[error("{role} of `{command}` was already taken")]
    AlreadyTaken {
        command: CommandIdentity,
        role: StreamRole,
    },

    /// Read or write on a stream wrapper after it was closed
    #[error("{role} is closed")]
    StreamClosed { role: StreamRole },

    /// I/O failure on one of the standard streams
    #[error("I/O error on {role}: {source}")]
    Io {
        role: StreamRole,
        #[source]
        source: io::Error,
    },

    /// Waiting for the exit status failed
    #[error("Failed to wait for `{command}`: {source}")]
    WaitFailed {
        command: CommandIdentity,
        #[source]
        source: io::Error,
    },

    /// No usable pid: the child was already reaped, or pid 0 was registered
    #[error("No valid pid for `{command}`")]
    InvalidPid { command: CommandIdentity },

    /// Failed to kill process
    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    /// Output consumption was cancelled and the process killed
    #[error("`{command}` was cancelled")]
    Cancelled { command: CommandIdentity },
}

impl ProcessError {
    /// Exit code for `ExitStatus` errors
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::ExitStatus { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Terminating signal for `Signal` errors
    pub fn signal(&self) -> Option<i32> {
        match self {
            ProcessError::Signal { signal, .. } => Some(*signal),
            _ => None,
        }
    }

    /// Captured stderr attached to an exit-status or signal error
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::ExitStatus { stderr, .. } | ProcessError::Signal { stderr, .. } => {
                stderr.as_deref()
            }
            _ => None,
        }
    }

    /// Command the error refers to, when known
    pub fn command(&self) -> Option<&CommandIdentity> {
        match self {
            ProcessError::SpawnFailed { command, .. }
            | ProcessError::ExitStatus { command, .. }
            | ProcessError::Signal { command, .. }
            | ProcessError::Stream { command, .. }
            | ProcessError::NotPiped { command, .. }
            | ProcessError::AlreadyTaken { command, .. }
            | ProcessError::WaitFailed { command, .. }
            | ProcessError::InvalidPid { command }
            | ProcessError::Cancelled { command } => Some(command),
            _ => None,
        }
    }

    /// Whether this is a write to a pipe whose reader has gone away
    pub fn is_broken_pipe(&self) -> bool {
        matches!(
            self,
            ProcessError::Io { source, .. }
                if matches!(source.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::Interrupted)
        )
    }

    /// Attach captured stderr to an exit-status or signal error
    pub fn with_stderr(mut self, summary: Option<String>) -> Self {
        if let ProcessError::ExitStatus { stderr, .. } | ProcessError::Signal { stderr, .. } =
            &mut self
        {
            if summary.is_some() {
                *stderr = summary;
            }
        }
        self
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
