//! SSE decoding for chat-completion streams
//!
//! Bytes flow through three stages: [`LineTokenizer`] frames them into lines,
//! [`EventDecoder`] classifies lines and extracts content deltas, and
//! [`DeltaStream`] drives both over an async byte stream.

pub mod decoder;
pub mod stream;
pub mod tokenizer;

pub use decoder::{DecoderLimits, DeltaEvent, EventDecoder, ProtocolLine};
pub use stream::DeltaStream;
pub use tokenizer::LineTokenizer;
