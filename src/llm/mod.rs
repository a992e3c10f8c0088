//! Completion provider collaborator.
//!
//! - `provider`: the message types and the streaming provider trait
//! - `openai_compat`: HTTP client for OpenAI-compatible `/chat/completions` endpoints

pub mod openai_compat;
pub mod provider;

pub use openai_compat::OpenAiCompatProvider;
pub use provider::{ByteStream, ChatMessage, ChatRole, CompletionProvider, ProviderFuture};
