//! Streaming session and SSE decoding.

pub mod session;
pub mod sse_decoder;

#[cfg(test)]
pub(crate) mod scripted;

pub use session::{StreamOutcome, StreamSummary, StreamTarget, StreamingSession};
pub use sse_decoder::{SseDecoder, SseFrame};
