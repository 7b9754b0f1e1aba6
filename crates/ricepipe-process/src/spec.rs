//! Process specification

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::CommandIdentity;

/// How one of the three standard streams is wired at spawn time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeMode {
    /// Connected to a pipe the handle can read or write
    Piped,
    /// Shared with the current process
    Inherited,
    /// Connected to the null device
    Discarded,
}

impl PipeMode {
    fn stdio(self) -> Stdio {
        match self {
            PipeMode::Piped => Stdio::piped(),
            PipeMode::Inherited => Stdio::inherit(),
            PipeMode::Discarded => Stdio::null(),
        }
    }
}

impl fmt::Display for PipeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipeMode::Piped => "piped",
            PipeMode::Inherited => "inherited",
            PipeMode::Discarded => "discarded",
        })
    }
}

/// Everything needed to launch a process
///
/// Defaults: stdin discarded, stdout and stderr piped, environment inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable, resolved through `PATH` when not a path
    pub program: String,
    /// Ordered arguments
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Environment variables set on top of the inherited environment
    pub env: BTreeMap<String, String>,
    /// Environment variables removed from the inherited environment
    pub env_remove: Vec<String>,
    /// Start from an empty environment
    pub env_clear: bool,
    pub stdin: PipeMode,
    pub stdout: PipeMode,
    pub stderr: PipeMode,
}

impl ProcessSpec {
    /// Create a spec for `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            env_remove: Vec::new(),
            env_clear: false,
            stdin: PipeMode::Discarded,
            stdout: PipeMode::Piped,
            stderr: PipeMode::Piped,
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add several environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    /// Remove an inherited environment variable
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Do not inherit the parent environment
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    pub fn stdin(mut self, mode: PipeMode) -> Self {
        self.stdin = mode;
        self
    }

    pub fn stdout(mut self, mode: PipeMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: PipeMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Identity used in errors and logs
    pub fn identity(&self) -> CommandIdentity {
        CommandIdentity::new(&self.program, &self.args)
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        if self.env_clear {
            cmd.env_clear();
        }
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        cmd.envs(&self.env);

        cmd.stdin(self.stdin.stdio());
        cmd.stdout(self.stdout.stdio());
        cmd.stderr(self.stderr.stdio());
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec = ProcessSpec::new("cat");
        assert_eq!(spec.stdin, PipeMode::Discarded);
        assert_eq!(spec.stdout, PipeMode::Piped);
        assert_eq!(spec.stderr, PipeMode::Piped);
        assert!(spec.args.is_empty());
        assert!(!spec.env_clear);
    }

    #[test]
    fn test_builder_keeps_argument_order() {
        let spec = ProcessSpec::new("grep")
            .arg("-e")
            .args(["b", "--color=never"])
            .env("LC_ALL", "C")
            .working_dir("/tmp")
            .stdin(PipeMode::Piped);

        assert_eq!(spec.args, vec!["-e", "b", "--color=never"]);
        assert_eq!(spec.env.get("LC_ALL").map(String::as_str), Some("C"));
        assert_eq!(spec.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.stdin, PipeMode::Piped);
        assert_eq!(spec.identity().to_string(), "grep -e b --color=never");
    }
}
