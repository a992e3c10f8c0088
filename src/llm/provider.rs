//! Provider-facing message model and streaming trait.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::tree::core::errors::TreeResult;

/// Role of a prompt message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// System instructions and grounding.
    System,
    /// User turn.
    User,
    /// Assistant turn.
    Assistant,
}

impl ChatRole {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One prompt message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: ChatRole,
    /// Text.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// User message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Boxed future type for provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw response body, delivered in whatever chunks the transport produces.
pub type ByteStream = Pin<Box<dyn Stream<Item = TreeResult<Vec<u8>>> + Send>>;

/// A text-completion provider that answers with an incrementally delivered body.
pub trait CompletionProvider: Send + Sync {
    /// Model identifier sent with every request.
    fn model(&self) -> &str;

    /// Open a streaming completion for `messages`.
    ///
    /// Resolves once the provider accepted the request; body chunks then arrive on
    /// the returned stream.
    ///
    /// # Errors
    /// Returns a rate-limit, quota or transport error if the request is rejected.
    fn stream_chat(&self, messages: Vec<ChatMessage>) -> ProviderFuture<'_, TreeResult<ByteStream>>;
}
