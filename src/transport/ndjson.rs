//! Newline-delimited JSON decoding over a streamed response body.
//!
//! The export endpoint returns one JSON value per line. The decoder never
//! buffers the full response: chunks are consumed as they arrive, lines
//! are split across chunk boundaries, and empty lines are tolerated (a
//! single line is never assumed to hold more than one record, but a chunk
//! may hold many lines). The timeout applies to the idle-read interval,
//! not the total transfer.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::error::{MixpanelError, Result};

/// A single-pass decoder of newline-delimited JSON values.
///
/// The sequence is finite (the Provider returns a bounded result) and not
/// restartable; dropping it releases the underlying HTTP connection.
pub struct NdjsonStream {
    inner: BoxStream<'static, Result<Bytes>>,
    buffer: BytesMut,
    idle_timeout: Duration,
    done: bool,
}

impl NdjsonStream {
    pub(crate) fn new<S>(inner: S, idle_timeout: Duration) -> Self
    where
        S: futures_util::Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
            buffer: BytesMut::new(),
            idle_timeout,
            done: false,
        }
    }

    /// Yield the next decoded value, or `None` at end of data.
    ///
    /// A decode failure or a read stalling past the idle timeout surfaces
    /// as an error and terminates the stream.
    pub async fn next_value(&mut self) -> Option<Result<Value>> {
        loop {
            if let Some(line) = self.take_line() {
                if line.is_empty() {
                    continue;
                }
                return Some(
                    serde_json::from_slice(&line)
                        .map_err(|e| MixpanelError::protocol("export", e.to_string())),
                );
            }

            if self.done {
                // Flush a trailing record without a final newline.
                if self.buffer.is_empty() {
                    return None;
                }
                let rest = self.buffer.split();
                let trimmed = trim_line(&rest);
                if trimmed.is_empty() {
                    return None;
                }
                return Some(
                    serde_json::from_slice(trimmed)
                        .map_err(|e| MixpanelError::protocol("export", e.to_string())),
                );
            }

            match tokio::time::timeout(self.idle_timeout, self.inner.next()).await {
                Err(_) => {
                    self.done = true;
                    return Some(Err(MixpanelError::transport(format!(
                        "export read stalled for {:?}",
                        self.idle_timeout
                    ))));
                }
                Ok(None) => self.done = true,
                Ok(Some(Err(e))) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(Some(Ok(chunk))) => self.buffer.extend_from_slice(&chunk),
            }
        }
    }

    /// Split one complete line (without its terminator) off the buffer.
    /// Returns `None` when no full line is buffered yet.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line = self.buffer.split_to(pos + 1);
        Some(trim_line(&line).to_vec())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((&last, rest)) = line.split_last() {
        if last == b'\n' || last == b'\r' {
            line = rest;
        } else {
            break;
        }
    }
    line
}
