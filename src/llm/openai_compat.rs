//! Streaming client for OpenAI-compatible chat completion endpoints.

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::llm::provider::{ByteStream, ChatMessage, CompletionProvider, ProviderFuture};
use crate::tree::core::config::ProviderConfig;
use crate::tree::core::errors::{TreeError, TreeResult};

/// Longest provider error body echoed back into an error message.
const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// HTTP provider speaking the `/chat/completions` streaming protocol.
pub struct OpenAiCompatProvider {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    /// Build a provider from config.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(config: &ProviderConfig) -> TreeResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let endpoint = Url::parse(&format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        ))?;

        if config.api_key.is_none() {
            warn!("No provider API key configured; requests will be sent unauthenticated");
        }

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

impl CompletionProvider for OpenAiCompatProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn stream_chat(&self, messages: Vec<ChatMessage>) -> ProviderFuture<'_, TreeResult<ByteStream>> {
        Box::pin(async move {
            let body = ChatCompletionRequest {
                model: &self.model,
                messages: &messages,
                stream: true,
            };
            debug!(
                "Requesting completion from {} with {} messages",
                self.endpoint,
                messages.len()
            );

            let mut request = self.client.post(self.endpoint.clone()).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|err| TreeError::ProviderTransport(err.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse().ok());
                let text = response.text().await.unwrap_or_default();
                let err = classify_status(status.as_u16(), &text, retry_after);
                warn!("Provider rejected completion request: {err}");
                return Err(err);
            }

            let stream = response.bytes_stream().map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|err| TreeError::ProviderTransport(err.to_string()))
            });
            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

/// Map a non-success HTTP status to an error category.
///
/// `429` is a rate limit unless the body reports an exhausted quota; `402` is
/// always a quota problem; everything else is a transport failure.
#[must_use]
pub fn classify_status(status: u16, body: &str, retry_after_secs: Option<u64>) -> TreeError {
    let message = provider_message(body);
    match status {
        429 if body.contains("insufficient_quota") => TreeError::ProviderQuotaExceeded(message),
        429 => TreeError::ProviderRateLimited {
            message,
            retry_after_secs,
        },
        402 => TreeError::ProviderQuotaExceeded(message),
        _ => TreeError::ProviderTransport(format!("provider returned {status}: {message}")),
    }
}

/// Map an error reported inside a completion stream to an error category.
///
/// Providers tag these with the same codes they use in rejected requests.
#[must_use]
pub fn classify_error_code(code: Option<&str>, message: String) -> TreeError {
    match code {
        Some("insufficient_quota" | "billing_hard_limit_reached") => {
            TreeError::ProviderQuotaExceeded(message)
        }
        Some("rate_limit_exceeded" | "rate_limit_error") => {
            TreeError::ProviderRateLimited {
                message,
                retry_after_secs: None,
            }
        }
        _ => TreeError::ProviderTransport(message),
    }
}

fn provider_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|value| {
        let error = value.get("error")?;
        error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .or_else(|| error.as_str())
            .map(str::to_string)
    });
    from_json.unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY_CHARS).collect())
}
