//! One request/response exchange against a completion provider.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::openai_compat::classify_error_code;
use crate::llm::{ChatMessage, CompletionProvider};
use crate::tree::core::errors::TreeResult;
use crate::tree::core::ids::{NodeId, TangentId};

use super::sse_decoder::{SseDecoder, SseFrame};

/// What a stream writes its reply into.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StreamTarget {
    /// Assistant response of a node.
    Node(NodeId),
    /// Next assistant turn of a tangent.
    Tangent(TangentId),
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node {id}"),
            Self::Tangent(id) => write!(f, "tangent {id}"),
        }
    }
}

/// How a stream ended without error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Sentinel or end of body reached.
    Completed,
    /// Caller abandoned the stream.
    Cancelled,
}

/// Result of a finished stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StreamSummary {
    /// Target the reply was written to.
    pub target: StreamTarget,
    /// Final accumulated text.
    pub text: String,
    /// Number of deltas delivered to the sink.
    pub chunks: usize,
    /// How the stream ended.
    pub outcome: StreamOutcome,
}

/// Drives a completion request and fans its deltas out to caller sinks.
#[derive(Clone)]
pub struct StreamingSession {
    provider: Arc<dyn CompletionProvider>,
}

impl StreamingSession {
    /// Create a session over `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    /// Model used for requests.
    #[must_use]
    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Stream a reply for `messages`.
    ///
    /// `on_delta` receives each text piece in order. `on_complete` is awaited exactly
    /// once with the accumulated text, whether the stream completed, was cancelled or
    /// failed part-way. After cancellation or failure `on_delta` is not called again.
    ///
    /// # Errors
    /// Returns the provider error when the request is rejected or the body fails, and
    /// otherwise the error from `on_complete`.
    pub async fn run<D, C, F>(
        &self,
        target: StreamTarget,
        messages: Vec<ChatMessage>,
        mut on_delta: D,
        on_complete: C,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamSummary>
    where
        D: FnMut(&str) + Send,
        C: FnOnce(String) -> F + Send,
        F: Future<Output = TreeResult<()>> + Send,
    {
        debug!(
            "Starting stream for {target} with {} messages (model: {})",
            messages.len(),
            self.provider.model()
        );

        let mut acc = Accumulator::default();
        let outcome = self.drive(messages, &mut acc, &mut on_delta, cancel).await;
        let committed = on_complete(acc.text.clone()).await;

        match outcome {
            Ok(outcome) => {
                committed?;
                match outcome {
                    StreamOutcome::Completed => info!(
                        "Stream for {target} completed: {} chunks, {} bytes",
                        acc.chunks,
                        acc.text.len()
                    ),
                    StreamOutcome::Cancelled => info!(
                        "Stream for {target} cancelled after {} chunks",
                        acc.chunks
                    ),
                }
                Ok(StreamSummary {
                    target,
                    text: acc.text,
                    chunks: acc.chunks,
                    outcome,
                })
            }
            Err(err) => {
                warn!(
                    "Stream for {target} failed after {} chunks: {err}",
                    acc.chunks
                );
                if let Err(commit_err) = committed {
                    warn!("Failed to commit partial reply for {target}: {commit_err}");
                }
                Err(err)
            }
        }
    }

    async fn drive<D>(
        &self,
        messages: Vec<ChatMessage>,
        acc: &mut Accumulator,
        on_delta: &mut D,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamOutcome>
    where
        D: FnMut(&str) + Send,
    {
        let mut body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            opened = self.provider.stream_chat(messages) => opened?,
        };

        let mut decoder = SseDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                next = body.next() => next,
            };

            let frames = match next {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(err)) => return Err(err),
                None => {
                    let frames = decoder.finish();
                    if let Some(outcome) = acc.apply(frames, on_delta, cancel)? {
                        return Ok(outcome);
                    }
                    return Ok(StreamOutcome::Completed);
                }
            };

            if let Some(outcome) = acc.apply(frames, on_delta, cancel)? {
                return Ok(outcome);
            }
        }
    }
}

#[derive(Default)]
struct Accumulator {
    text: String,
    chunks: usize,
}

impl Accumulator {
    fn apply<D>(
        &mut self,
        frames: Vec<SseFrame>,
        on_delta: &mut D,
        cancel: &CancellationToken,
    ) -> TreeResult<Option<StreamOutcome>>
    where
        D: FnMut(&str),
    {
        for frame in frames {
            match frame {
                SseFrame::Delta(piece) => {
                    if cancel.is_cancelled() {
                        return Ok(Some(StreamOutcome::Cancelled));
                    }
                    on_delta(&piece);
                    self.text.push_str(&piece);
                    self.chunks += 1;
                }
                SseFrame::Done => return Ok(Some(StreamOutcome::Completed)),
                SseFrame::Error { message, code } => {
                    return Err(classify_error_code(code.as_deref(), message));
                }
            }
        }
        Ok(None)
    }
}
