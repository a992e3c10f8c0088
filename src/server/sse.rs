//! Bridges engine delta sinks onto an SSE response.

use std::convert::Infallible;
use std::future::Future;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::stream::StreamSummary;

use super::error::{ApiError, ErrorBody};

/// Event produced by a running engine stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// Text piece.
    Delta(String),
    /// Stream finished.
    Done(StreamSummary),
    /// Stream failed.
    Failed(TreeError),
}

impl StreamEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }

    fn into_sse(self) -> Event {
        let built = match &self {
            Self::Delta(text) => Event::default()
                .event("delta")
                .json_data(serde_json::json!({ "text": text })),
            Self::Done(summary) => Event::default().event("done").json_data(summary),
            Self::Failed(err) => Event::default().event("error").json_data(ErrorBody::from(err)),
        };
        built.unwrap_or_else(|err| {
            debug!("Failed to encode SSE event: {err}");
            Event::default().event("error")
        })
    }
}

/// Sender side handed to the engine as its delta sink.
#[derive(Clone, Debug)]
pub struct DeltaSender(UnboundedSender<StreamEvent>);

impl DeltaSender {
    /// Delta sink closure; sends are dropped once the client is gone.
    pub fn into_sink(self) -> impl FnMut(&str) + Send + 'static {
        move |piece: &str| {
            let _ = self.0.send(StreamEvent::Delta(piece.to_string()));
        }
    }
}

/// Run `op` in a background task and stream its events.
///
/// Errors raised before the first delta (unknown ids, invalid input, busy targets,
/// rejected provider requests) are returned as a plain HTTP error. Once the SSE
/// response is open, a client disconnect cancels the stream; the engine still
/// commits the partial reply.
///
/// # Errors
/// Returns the engine error if the stream failed before producing any output.
pub async fn stream_reply<F, Fut>(op: F) -> Result<Response, ApiError>
where
    F: FnOnce(DeltaSender, CancellationToken) -> Fut,
    Fut: Future<Output = TreeResult<StreamSummary>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let task = op(DeltaSender(tx.clone()), cancel);
    tokio::spawn(async move {
        let event = match task.await {
            Ok(summary) => StreamEvent::Done(summary),
            Err(err) => StreamEvent::Failed(err),
        };
        let _ = tx.send(event);
    });

    let first = match rx.recv().await {
        Some(StreamEvent::Failed(err)) => return Err(ApiError(err)),
        Some(event) => event,
        None => {
            return Err(ApiError(TreeError::ProviderTransport(
                "stream task ended without a result".to_string(),
            )));
        }
    };

    let events = stream::unfold(
        EventState {
            pending: Some(first),
            rx,
            _guard: guard,
            finished: false,
        },
        |mut state| async move {
            if state.finished {
                return None;
            }
            let event = match state.pending.take() {
                Some(event) => event,
                None => state.rx.recv().await?,
            };
            state.finished = event.is_terminal();
            Some((Ok::<Event, Infallible>(event.into_sse()), state))
        },
    );

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

struct EventState {
    pending: Option<StreamEvent>,
    rx: UnboundedReceiver<StreamEvent>,
    _guard: DropGuard,
    finished: bool,
}
