//! Newline-delimited JSON-RPC framing.
//!
//! Tool servers write one JSON object per line on stdout, but pipe reads
//! hand us arbitrary chunks. The framer keeps the trailing partial line
//! between pushes and yields complete messages lazily.

use serde::Serialize;

use crate::error::Result;
use crate::mcp::protocol::Message;

/// Accumulates stdout chunks and splits them into messages.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate over every complete message now available.
    ///
    /// Blank lines and lines that do not parse as JSON-RPC are skipped.
    /// Bytes after the last newline stay buffered for the next push, even
    /// if the returned iterator is dropped early.
    pub fn push(&mut self, chunk: &[u8]) -> Messages<'_> {
        self.buf.extend_from_slice(chunk);
        Messages { framer: self }
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

/// Lazy iterator over the messages completed by one [`Framer::push`].
pub struct Messages<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Messages<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        loop {
            let line = self.framer.next_line()?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match Message::parse(&line) {
                Some(msg) => return Some(msg),
                None => {
                    tracing::trace!(
                        line = %String::from_utf8_lossy(&line),
                        "Dropping non JSON-RPC line"
                    );
                }
            }
        }
    }
}

/// Serialize a message as a single newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}
