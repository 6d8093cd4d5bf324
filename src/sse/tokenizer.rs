//! Line framing for SSE byte streams
//!
//! Network reads can end anywhere: in the middle of a line, in the middle of a
//! JSON payload, or in the middle of a multi-byte UTF-8 character. The
//! tokenizer accumulates raw bytes and only hands out lines once their `\n`
//! terminator has arrived. Because `\n` never occurs inside a multi-byte UTF-8
//! sequence, splitting on raw bytes and decoding whole lines gives the same
//! result as a stateful incremental text decoder.

use bytes::BytesMut;

/// Splits an incrementally delivered byte stream into newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineTokenizer {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    /// Set by [`discard_line`](LineTokenizer::discard_line) until the next newline.
    discarding: bool,
}

impl LineTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the bytes of one network read.
    pub fn push(&mut self, chunk: &[u8]) {
        let chunk = if self.discarding {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    &chunk[pos + 1..]
                }
                None => return,
            }
        } else {
            chunk
        };
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete line, without its `\n` (or `\r\n`) terminator.
    ///
    /// Returns `None` until a newline has actually been observed; bytes after
    /// the last newline stay buffered for the next [`push`](Self::push).
    pub fn next_line(&mut self) -> Option<String> {
        let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buffer.len();
            return None;
        };
        let pos = self.scanned + offset;
        self.scanned = 0;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        // Invalid sequences become U+FFFD, same as a non-fatal text decoder.
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered. Returns how many bytes were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        discarded
    }

    /// Drop the unterminated line buffered so far, and the rest of it as it
    /// arrives, so that framing resumes after its newline.
    ///
    /// Only meaningful once every complete line has been taken.
    pub fn discard_line(&mut self) -> usize {
        self.discarding = true;
        self.clear()
    }
}

impl Iterator for LineTokenizer {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line()
    }
}
