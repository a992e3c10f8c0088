//! In-process completion provider that replays scripted bodies.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::stream;
use tokio::sync::Notify;

use crate::llm::{ByteStream, ChatMessage, CompletionProvider, ProviderFuture};
use crate::tree::core::errors::{TreeError, TreeResult};

/// One scripted provider answer.
#[derive(Clone, Debug)]
pub(crate) enum Script {
    /// Stream these deltas then the sentinel.
    Reply(Vec<String>),
    /// Stream these deltas then fail with a transport error.
    FailAfter(Vec<String>, String),
    /// Reject the request as rate limited.
    RateLimited(Option<u64>),
    /// Reject the request as out of quota.
    QuotaExceeded,
    /// Stream raw body chunks as-is.
    Raw(Vec<Vec<u8>>),
}

impl Script {
    pub(crate) fn reply(pieces: &[&str]) -> Self {
        Self::Reply(pieces.iter().map(ToString::to_string).collect())
    }

    pub(crate) fn fail_after(pieces: &[&str], message: &str) -> Self {
        Self::FailAfter(
            pieces.iter().map(ToString::to_string).collect(),
            message.to_string(),
        )
    }
}

pub(crate) fn sse_delta(piece: &str) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": piece } }] })
    )
    .into_bytes()
}

/// Provider double that records every request.
pub(crate) struct ScriptedProvider {
    queued: Mutex<VecDeque<Script>>,
    fallback: Script,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedProvider {
    /// Answer every request with `fallback`.
    pub(crate) fn new(fallback: Script) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Hold every body until `gate` is notified.
    pub(crate) fn gated(fallback: Script, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(fallback)
        }
    }

    /// Use `script` for the next request only.
    pub(crate) fn enqueue(&self, script: Script) {
        self.queued.lock().unwrap().push_back(script);
    }

    /// Every message list sent so far.
    pub(crate) fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    /// The most recent message list.
    pub(crate) fn last_request(&self) -> Vec<ChatMessage> {
        self.requests().pop().unwrap_or_default()
    }
}

impl CompletionProvider for ScriptedProvider {
    fn model(&self) -> &str {
        "scripted"
    }

    fn stream_chat(&self, messages: Vec<ChatMessage>) -> ProviderFuture<'_, TreeResult<ByteStream>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(messages);
            let script = self
                .queued
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());

            let mut items: Vec<TreeResult<Vec<u8>>> = match script {
                Script::Reply(pieces) => {
                    let mut items: Vec<_> = pieces.iter().map(|p| Ok(sse_delta(p))).collect();
                    items.push(Ok(b"data: [DONE]\n\n".to_vec()));
                    items
                }
                Script::FailAfter(pieces, message) => {
                    let mut items: Vec<_> = pieces.iter().map(|p| Ok(sse_delta(p))).collect();
                    items.push(Err(TreeError::ProviderTransport(message)));
                    items
                }
                Script::RateLimited(retry_after_secs) => {
                    return Err(TreeError::ProviderRateLimited {
                        message: "Rate limit reached".to_string(),
                        retry_after_secs,
                    });
                }
                Script::QuotaExceeded => {
                    return Err(TreeError::ProviderQuotaExceeded(
                        "You exceeded your current quota".to_string(),
                    ));
                }
                Script::Raw(chunks) => chunks.into_iter().map(Ok).collect(),
            };

            let body: ByteStream = match self.gate.clone() {
                Some(gate) => {
                    let first = if items.is_empty() {
                        Ok(Vec::new())
                    } else {
                        items.remove(0)
                    };
                    let held = stream::once(async move {
                        gate.notified().await;
                        first
                    });
                    Box::pin(futures::StreamExt::chain(held, stream::iter(items)))
                }
                None => Box::pin(stream::iter(items)),
            };
            Ok(body)
        })
    }
}
