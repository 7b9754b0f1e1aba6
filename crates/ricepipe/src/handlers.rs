//! Input/output handler contracts
//!
//! An [`InputHandler`] writes a value into a child's stdin and closes it on every
//! path. An [`OutputHandler`] turns a [`ProcessOutput`] into a result; the exit
//! status and stderr handling live in `ProcessOutput`, so handlers only decide how
//! stdout is represented.

use async_trait::async_trait;
use bytes::Bytes;
use ricepipe_process::{ProcessOutput, StdinWriter};

use crate::error::Result;

/// How values are framed on stdin, or how stdout is represented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Raw bytes, no framing
    Bytes,
    /// UTF-8 text, no framing
    Text,
    /// One UTF-8 line per item, newline terminated
    #[default]
    TextLine,
    /// One byte line per item, newline terminated
    ByteLine,
}

impl Encoding {
    /// Whether each item is followed by a line feed when written
    pub fn is_line_framed(self) -> bool {
        matches!(self, Encoding::TextLine | Encoding::ByteLine)
    }

    /// Frame one item for stdin
    pub fn encode<I: StdinItem>(self, item: I) -> Bytes {
        let bytes = item.into_bytes();
        if !self.is_line_framed() {
            return bytes;
        }
        let mut framed = Vec::with_capacity(bytes.len() + 1);
        framed.extend_from_slice(&bytes);
        framed.push(b'\n');
        Bytes::from(framed)
    }
}

/// Values that can be written to a process's stdin
pub trait StdinItem: Send + 'static {
    fn into_bytes(self) -> Bytes;
}

impl StdinItem for Bytes {
    fn into_bytes(self) -> Bytes {
        self
    }
}

impl StdinItem for Vec<u8> {
    fn into_bytes(self) -> Bytes {
        Bytes::from(self)
    }
}

impl StdinItem for String {
    fn into_bytes(self) -> Bytes {
        Bytes::from(self)
    }
}

impl StdinItem for &'static str {
    fn into_bytes(self) -> Bytes {
        Bytes::from_static(self.as_bytes())
    }
}

/// Writes a value into stdin
///
/// Implementations must close `stdin` on every path, including failures. A reader
/// that went away early (broken pipe) is expected and must not be reported.
#[async_trait]
pub trait InputHandler<T: Send + 'static>: Send + Sync {
    async fn process_input(&self, value: T, stdin: StdinWriter) -> Result<()>;
}

/// Produces a result from a running process's output
#[async_trait]
pub trait OutputHandler: Send + Sync {
    type Output: Send;

    async fn process_output(&self, output: ProcessOutput) -> Result<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_framing() {
        assert_eq!(Encoding::TextLine.encode("a"), Bytes::from_static(b"a\n"));
        assert_eq!(Encoding::ByteLine.encode(vec![1u8, 2]), Bytes::from_static(&[1, 2, b'\n']));
        assert_eq!(Encoding::Bytes.encode(vec![1u8, 2]), Bytes::from_static(&[1, 2]));
        assert_eq!(Encoding::Text.encode(String::from("x")), Bytes::from_static(b"x"));
    }

    #[test]
    fn test_default_is_text_lines() {
        assert_eq!(Encoding::default(), Encoding::TextLine);
    }
}
