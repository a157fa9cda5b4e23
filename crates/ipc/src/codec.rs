// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming NDJSON parser and encoder.

use crate::frame::FrameError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Hard cap on bytes buffered for one peer. Overflow discards the buffer
/// and poisons the connection.
pub const MAX_BUFFERED_BYTES: usize = 10 * 1024 * 1024;

/// One decoded line: a valid frame, or a parse failure that does not
/// corrupt the rest of the stream.
#[derive(Debug)]
pub enum ParsedLine<T> {
    Frame(T),
    Invalid {
        error: serde_json::Error,
        /// Truncated copy of the offending line, for logging.
        snippet: String,
    },
}

const SNIPPET_LEN: usize = 120;

/// Incremental line-framed JSON parser.
///
/// Accepts arbitrary byte chunks and yields complete objects in order,
/// preserving partial trailing bytes across calls. Empty lines are
/// skipped; unparseable lines surface as [`ParsedLine::Invalid`] and
/// parsing continues with the next line.
#[derive(Debug, Default)]
pub struct NdjsonParser {
    buf: Vec<u8>,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any partial line, e.g. after a peer reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently buffered without a terminating newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk, returning every line completed by it.
    ///
    /// `Err(FrameError::Overflow)` means the buffer cap was exceeded; the
    /// buffer has been discarded and the connection should be torn down.
    pub fn push<T: DeserializeOwned>(
        &mut self,
        chunk: &[u8],
    ) -> Result<Vec<ParsedLine<T>>, FrameError> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
            if line.len() > MAX_BUFFERED_BYTES {
                self.buf.clear();
                return Err(FrameError::Overflow(MAX_BUFFERED_BYTES));
            }
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(trimmed) {
                Ok(frame) => out.push(ParsedLine::Frame(frame)),
                Err(error) => out.push(ParsedLine::Invalid {
                    error,
                    snippet: trimmed.chars().take(SNIPPET_LEN).collect(),
                }),
            }
        }

        if self.buf.len() > MAX_BUFFERED_BYTES {
            self.buf.clear();
            return Err(FrameError::Overflow(MAX_BUFFERED_BYTES));
        }
        Ok(out)
    }
}

/// Encode one frame as an NDJSON line.
///
/// Compact JSON never contains a raw newline (strings escape control
/// characters), so the line invariant holds by construction.
pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(frame).map_err(FrameError::Encode)?;
    debug_assert!(!bytes.contains(&b'\n'));
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
