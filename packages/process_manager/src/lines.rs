//! Newline framing for process output.
//!
//! Pipes deliver bytes in arbitrary chunks; consumers want whole lines.
//! A line only counts once its terminating `\n` has arrived, so a trailing
//! partial segment is held back and, at end of input, dropped.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

const READ_CHUNK_SIZE: usize = 8192;

/// Accumulates byte chunks and yields complete lines.
#[derive(Debug, Default)]
pub struct LineDemuxer {
    buf: Vec<u8>,
}

impl LineDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    ///
    /// Lines exclude the `\n` but keep any `\r` before it. Invalid UTF-8 is
    /// replaced with U+FFFD. Multi-byte characters split across chunks are
    /// decoded intact since only whole lines are ever decoded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        // Only scan the new bytes; the retained segment has no newline
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);

        for (offset, byte) in self.buf[scan_from..].iter().enumerate() {
            if *byte == b'\n' {
                let end = scan_from + offset;
                lines.push(decode(&self.buf[start..end]));
                start = end + 1;
            }
        }

        self.buf.drain(..start);
        lines
    }

    /// Bytes currently held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Explicit final flush: the retained partial segment, if any.
    pub fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(decode(&self.buf))
        }
    }
}

fn decode(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

/// Pump `reader` to end-of-input, calling `on_line` for each complete line.
///
/// A read error ends the pump like EOF does. Any partial segment left at
/// the end is discarded. Returns the number of lines delivered.
pub async fn read_lines<R, F, Fut>(mut reader: R, mut on_line: F) -> usize
where
    R: AsyncRead + Unpin,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut demuxer = LineDemuxer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut count = 0;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in demuxer.push(&chunk[..n]) {
                    count += 1;
                    on_line(line).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reading process output");
                break;
            }
        }
    }

    if demuxer.pending() > 0 {
        debug!(
            bytes = demuxer.pending(),
            "Discarding unterminated trailing output"
        );
    }
    count
}
