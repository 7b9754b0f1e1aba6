//! Concrete input and output handlers

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use ricepipe_process::{ProcessOutput, StdinWriter};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::handlers::{Encoding, InputHandler, OutputHandler, StdinItem};
use crate::pipeline::Pipeline;

/// Close stdin after feeding, keeping the first real failure
async fn finish(mut stdin: StdinWriter, fed: Result<()>) -> Result<()> {
    let fed = match fed {
        Err(PipelineError::Process(err)) if err.is_broken_pipe() => {
            debug!(error = %err, "Process stopped reading stdin");
            Ok(())
        }
        other => other,
    };
    let closed = stdin.shutdown().await.map_err(PipelineError::from);
    fed.and(closed)
}

/// Feeds every item of a pipeline, framed by an [`Encoding`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamInput {
    encoding: Encoding,
}

impl StreamInput {
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }
}

#[async_trait]
impl<T: StdinItem> InputHandler<Pipeline<T>> for StreamInput {
    async fn process_input(&self, mut value: Pipeline<T>, mut stdin: StdinWriter) -> Result<()> {
        let mut fed = Ok(());
        while let Some(item) = value.next().await {
            let chunk = match item {
                Ok(item) => self.encoding.encode(item),
                Err(err) => {
                    fed = Err(err);
                    break;
                }
            };
            if let Err(err) = stdin.write_all(&chunk).await {
                fed = Err(err.into());
                break;
            }
        }
        finish(stdin, fed).await
    }
}

/// Feeds one buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesInput;

#[async_trait]
impl InputHandler<Bytes> for BytesInput {
    async fn process_input(&self, value: Bytes, mut stdin: StdinWriter) -> Result<()> {
        let fed = stdin.write_all(&value).await.map_err(PipelineError::from);
        finish(stdin, fed).await
    }
}

/// Fully collected stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collected {
    Bytes(Bytes),
    Text(String),
    TextLines(Vec<String>),
    ByteLines(Vec<Vec<u8>>),
}

impl Collected {
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Collected::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Collected::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_lines(self) -> Option<Vec<String>> {
        match self {
            Collected::TextLines(lines) => Some(lines),
            _ => None,
        }
    }
}

/// Collects stdout in the shape chosen by its [`Encoding`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectOutput(pub Encoding);

#[async_trait]
impl OutputHandler for CollectOutput {
    type Output = Collected;

    async fn process_output(&self, output: ProcessOutput) -> Result<Collected> {
        let stdout = Pipeline::from_try_stream(output);
        Ok(match self.0 {
            Encoding::Bytes => Collected::Bytes(stdout.bytes().await?),
            Encoding::Text => Collected::Text(stdout.text().await?),
            Encoding::TextLine => Collected::TextLines(stdout.lines().collect().await?),
            Encoding::ByteLine => Collected::ByteLines(stdout.byte_lines().collect().await?),
        })
    }
}

/// Lazy stdout byte chunks
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOutput;

#[async_trait]
impl OutputHandler for StreamOutput {
    type Output = Pipeline<Bytes>;

    async fn process_output(&self, output: ProcessOutput) -> Result<Pipeline<Bytes>> {
        Ok(Pipeline::from_try_stream(output))
    }
}

/// Lazy stdout text lines
#[derive(Debug, Clone, Copy, Default)]
pub struct LineOutput;

#[async_trait]
impl OutputHandler for LineOutput {
    type Output = Pipeline<String>;

    async fn process_output(&self, output: ProcessOutput) -> Result<Pipeline<String>> {
        Ok(Pipeline::from_try_stream(output).lines())
    }
}
