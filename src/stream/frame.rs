//! Line-oriented event-stream framing.
//!
//! Only `data:` lines carry payloads; every other line (comments, `event:`,
//! `id:`, blank separators) is skipped.

use futures_util::{Stream, StreamExt};
use thiserror::Error;

const DATA_PREFIX: &str = "data:";

/// Longest line accepted before the stream is treated as broken.
pub const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream read failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Extracts the payload of a `data:` line, trimmed of surrounding whitespace.
///
/// Returns `None` for non-data lines and for data lines with an empty payload.
pub fn data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    (!payload.is_empty()).then_some(payload)
}

/// Yields `data:` payloads from a chunked byte stream.
pub struct FrameReader<S> {
    inner: S,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_len: usize,
    finished: bool,
}

impl<S, B, E> FrameReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    pub fn new(inner: S) -> Self {
        Self::with_max_line_len(inner, DEFAULT_MAX_LINE_LEN)
    }

    pub fn with_max_line_len(inner: S, max_line_len: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            scanned: 0,
            max_line_len,
            finished: false,
        }
    }

    /// Reads until the next payload is available.
    ///
    /// `Ok(None)` means the underlying stream ended. A trailing line without
    /// a terminating newline is still delivered.
    pub async fn next_frame(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(payload) = data_payload(&line) {
                    return Ok(Some(payload.to_string()));
                }
            }

            if self.finished {
                return Ok(None);
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(chunk.as_ref());
                    if self.buffer.len() > self.max_line_len
                        && !self.buffer[self.scanned..].contains(&b'\n')
                    {
                        return Err(FrameError::LineTooLong {
                            limit: self.max_line_len,
                        });
                    }
                }
                Some(Err(err)) => return Err(FrameError::Transport(err.into())),
                None => {
                    self.finished = true;
                    if !self.buffer.is_empty() {
                        self.buffer.push(b'\n');
                    }
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let Some(offset) = self.buffer[self.scanned..].iter().position(|byte| *byte == b'\n')
        else {
            self.scanned = self.buffer.len();
            return None;
        };
        let end = self.scanned + offset;
        self.scanned = 0;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
