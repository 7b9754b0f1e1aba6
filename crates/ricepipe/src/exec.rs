//! Spawning processes with handlers attached

use std::sync::Arc;

use futures::FutureExt;
use ricepipe_process::{
    BoxError, Feed, PipeMode, ProcessContext, ProcessHandle, ProcessOutput, ProcessSpec,
    StderrPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::handlers::{Encoding, InputHandler, OutputHandler};

/// Options for [`Pipeline::run_with`](crate::Pipeline::run_with)
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Framing of items written to stdin
    pub encoding: Encoding,
    pub stderr: StderrPolicy,
    /// Kills the process when fired
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn stderr(mut self, policy: StderrPolicy) -> Self {
        self.stderr = policy;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// One process launch: spec, stderr policy, cancellation and optional context
#[derive(Debug)]
pub struct Execution {
    spec: ProcessSpec,
    stderr: StderrPolicy,
    cancel: Option<CancellationToken>,
    context: Option<ProcessContext>,
}

impl Execution {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            stderr: StderrPolicy::default(),
            cancel: None,
            context: None,
        }
    }

    pub fn stderr(mut self, policy: StderrPolicy) -> Self {
        self.stderr = policy;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Track the process in `context` until it is reaped
    pub fn context(mut self, context: &ProcessContext) -> Self {
        self.context = Some(context.clone());
        self
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle> {
        let handle = match &self.context {
            Some(context) => context.spawn(spec)?,
            None => ProcessHandle::spawn(spec)?,
        };
        Ok(handle)
    }

    fn attach(self, handle: ProcessHandle, feed: Option<Feed>) -> Result<ProcessOutput> {
        let output = handle.into_output(feed, self.stderr)?;
        Ok(match self.cancel {
            Some(token) => output.with_cancellation(token),
            None => output,
        })
    }

    /// Spawn with stdin as configured in the spec, nobody feeding it
    pub fn output(self) -> Result<ProcessOutput> {
        let handle = self.spawn(&self.spec)?;
        self.attach(handle, None)
    }

    /// Spawn with piped stdin fed by `input`
    pub fn output_with<T, I>(self, input: I, value: T) -> Result<ProcessOutput>
    where
        T: Send + 'static,
        I: InputHandler<T> + 'static,
    {
        let spec = self.spec.clone().stdin(PipeMode::Piped);
        let mut handle = self.spawn(&spec)?;
        let stdin = handle.take_stdin()?;

        let input = Arc::new(input);
        let pid = handle.pid();
        let feed: Feed = async move {
            let result = input.process_input(value, stdin).await;
            debug!(pid = %pid, ok = result.is_ok(), "Stdin feed finished");
            result.map_err(|err| Box::new(err) as BoxError)
        }
        .boxed();

        self.attach(handle, Some(feed))
    }

    /// Spawn, feed `value` through `input` and hand stdout to `output`
    pub async fn execute<T, I, O>(self, input: I, value: T, output: &O) -> Result<O::Output>
    where
        T: Send + 'static,
        I: InputHandler<T> + 'static,
        O: OutputHandler + ?Sized,
    {
        let process = self.output_with(input, value)?;
        output.process_output(process).await
    }
}

/// Spawn `spec` with piped stdin, feed `value` through `input` and hand stdout to
/// `output`
pub async fn execute<T, I, O>(spec: ProcessSpec, input: I, value: T, output: &O) -> Result<O::Output>
where
    T: Send + 'static,
    I: InputHandler<T> + 'static,
    O: OutputHandler + ?Sized,
{
    Execution::new(spec).execute(input, value, output).await
}
