//! Chat-completion event decoding
//!
//! Turns protocol lines into content deltas. Only the subset of SSE used by
//! OpenAI-compatible chat completion streams is understood:
//!
//! - `:` comment lines and blank lines are skipped
//! - `data: [DONE]` ends the logical stream, whatever is still buffered
//! - `data: {json}` carries `choices[0].delta.content`
//! - anything else is ignored so new frame types do not break old clients
//!
//! A data payload that is not valid JSON is not an error. It is held as an
//! undecoded *carry* and re-joined with the following line(s) when those turn
//! out to be the rest of the same payload. The carry is bounded by
//! [`DecoderLimits`] so that a payload that never becomes valid cannot stall
//! the stream forever.

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::tokenizer::LineTokenizer;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Path of the incremental text inside a chunk payload.
const CONTENT_POINTER: &str = "/choices/0/delta/content";

/// A single line of the stream, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolLine<'a> {
    Comment,
    Blank,
    /// A data frame, holding the trimmed payload after the `data: ` prefix.
    Data(&'a str),
    Unknown,
}

impl<'a> ProtocolLine<'a> {
    pub fn classify(line: &'a str) -> Self {
        if line.starts_with(':') {
            ProtocolLine::Comment
        } else if line.trim().is_empty() {
            ProtocolLine::Blank
        } else if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
            ProtocolLine::Data(payload.trim())
        } else {
            ProtocolLine::Unknown
        }
    }
}

/// A decoded unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEvent {
    /// Incremental assistant text. Never empty.
    Content(String),
    /// The sentinel was observed; nothing after it is decoded.
    Done,
}

/// Bounds on how much not-yet-decodable data is held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
    /// Largest carry, in bytes, before it is dropped.
    pub max_carry_bytes: usize,
    /// Number of reads a carry may wait for its continuation.
    pub max_carry_reads: u32,
    /// Longest unterminated line kept while waiting for its newline.
    pub max_line_bytes: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            max_carry_bytes: 1024 * 1024,
            max_carry_reads: 64,
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// Payload that failed to parse and is waiting for the rest of its bytes.
#[derive(Debug)]
struct Carry {
    payload: String,
    reads: u32,
}

enum Decoded {
    Skip,
    Delta(String),
    Done,
    Deferred(String),
}

/// Stateful decoder for one response stream.
///
/// Feed it raw network reads with [`feed`](Self::feed); it returns the events
/// that became decodable with those bytes.
#[derive(Debug, Default)]
pub struct EventDecoder {
    lines: LineTokenizer,
    carry: Option<Carry>,
    limits: DecoderLimits,
    finished: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: DecoderLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Whether the sentinel has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether an undecodable payload is currently held back.
    pub fn has_carry(&self) -> bool {
        self.carry.is_some()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DeltaEvent> {
        let mut events = Vec::new();
        if self.finished {
            trace!("Ignoring {} bytes received after the sentinel", chunk.len());
            return events;
        }

        self.lines.push(chunk);

        while let Some(line) = self.lines.next_line() {
            // A line that starts a new frame drops the carry and is decoded below.
            if let Some(carry) = self.carry.take() {
                if let Some(content) = self.continue_carry(carry, &line) {
                    events.extend(content.map(DeltaEvent::Content));
                    continue;
                }
            }

            match self.decode_line(&line) {
                Decoded::Skip => {}
                Decoded::Delta(content) => events.push(DeltaEvent::Content(content)),
                Decoded::Done => {
                    self.finish_stream();
                    events.push(DeltaEvent::Done);
                    break;
                }
                Decoded::Deferred(payload) => {
                    debug!("Deferring undecodable payload of {} bytes", payload.len());
                    self.carry = Some(Carry { payload, reads: 0 });
                }
            }
        }

        if self.lines.pending() > self.limits.max_line_bytes {
            let discarded = self.lines.discard_line();
            warn!(
                "Dropping unterminated line: {} bytes exceeds the limit of {}",
                discarded, self.limits.max_line_bytes
            );
        }

        self.age_carry();
        events
    }

    /// Signal end of transport. Unterminated bytes and any carry are discarded.
    pub fn finish(&mut self) {
        let discarded = self.lines.clear();
        if discarded > 0 {
            debug!("Discarding {} unterminated bytes at end of stream", discarded);
        }
        if let Some(carry) = self.carry.take() {
            warn!(
                "Stream ended with an undecodable payload of {} bytes",
                carry.payload.len()
            );
        }
    }

    fn decode_line(&self, line: &str) -> Decoded {
        match ProtocolLine::classify(line) {
            ProtocolLine::Comment | ProtocolLine::Blank => Decoded::Skip,
            ProtocolLine::Unknown => {
                trace!("Ignoring non-data line: {}", line);
                Decoded::Skip
            }
            ProtocolLine::Data(DONE_SENTINEL) => Decoded::Done,
            ProtocolLine::Data(payload) => match parse_content(payload) {
                Ok(Some(content)) => Decoded::Delta(content),
                Ok(None) => Decoded::Skip,
                Err(_) => Decoded::Deferred(payload.to_string()),
            },
        }
    }

    /// Try to complete a held payload with the next line.
    ///
    /// Returns `None` when `line` is a frame of its own, in which case the
    /// carry is dropped and the caller decodes `line` normally. Otherwise the
    /// line was consumed as a continuation and the result holds any content.
    fn continue_carry(&mut self, carry: Carry, line: &str) -> Option<Option<String>> {
        if ProtocolLine::classify(line) != ProtocolLine::Unknown {
            warn!(
                "Dropping undecodable payload of {} bytes: a new frame started",
                carry.payload.len()
            );
            return None;
        }

        let joined = format!("{}\n{}", carry.payload, line);
        match parse_content(&joined) {
            Ok(content) => {
                debug!("Completed deferred payload ({} bytes)", joined.len());
                Some(content)
            }
            Err(_) if joined.len() > self.limits.max_carry_bytes => {
                warn!(
                    "Dropping undecodable payload: {} bytes exceeds the limit of {}",
                    joined.len(),
                    self.limits.max_carry_bytes
                );
                Some(None)
            }
            Err(_) => {
                self.carry = Some(Carry {
                    payload: joined,
                    reads: carry.reads,
                });
                Some(None)
            }
        }
    }

    fn age_carry(&mut self) {
        let Some(carry) = self.carry.as_mut() else {
            return;
        };
        carry.reads += 1;
        if carry.reads > self.limits.max_carry_reads {
            warn!(
                "Dropping undecodable payload after {} reads without a continuation",
                self.limits.max_carry_reads
            );
            self.carry = None;
        }
    }

    fn finish_stream(&mut self) {
        self.finished = true;
        self.carry = None;
        let discarded = self.lines.clear();
        if discarded > 0 {
            debug!("Sentinel observed, ignoring {} buffered bytes", discarded);
        }
    }
}

/// Extract `choices[0].delta.content` from a payload.
///
/// Valid JSON without a non-empty string at that path (role-only frames,
/// keep-alives, usage frames) yields `Ok(None)`.
pub fn parse_content(payload: &str) -> Result<Option<String>, serde_json::Error> {
    let value: Value = serde_json::from_str(payload)?;
    Ok(value
        .pointer(CONTENT_POINTER)
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(str::to_owned))
}
