//! Error types for the conversation tree engine.

use thiserror::Error;

/// Conversation tree error type.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Referenced node, tangent or conversation id is absent.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// The id that could not be resolved.
        id: String,
    },
    /// Backing store write or read failed.
    #[error("persistence error: {0}")]
    Persistence(String),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Provider rejected the request because of rate limiting.
    #[error("provider rate limited: {message}")]
    ProviderRateLimited {
        /// Provider supplied message.
        message: String,
        /// Seconds to wait, when the provider said so.
        retry_after_secs: Option<u64>,
    },
    /// Provider account has no remaining quota or credits.
    #[error("provider quota exceeded: {0}")]
    ProviderQuotaExceeded(String),
    /// Network or stream failure while talking to the provider.
    #[error("provider transport error: {0}")]
    ProviderTransport(String),
    /// HTTP client error.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    /// A stream is already running against the same node or tangent.
    #[error("a reply is already streaming for {0}")]
    StreamInProgress(String),
    /// Caller supplied unusable input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error category surfaced to the UI layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Lookup failed; recovered locally as a no-op.
    NotFound,
    /// Store write failed; state left unchanged.
    Persistence,
    /// Provider rate limit hit.
    RateLimited,
    /// Provider quota exhausted.
    QuotaExceeded,
    /// Generic network or stream failure.
    Transport,
    /// Input or configuration rejected.
    Invalid,
    /// Another stream holds the target.
    Busy,
}

impl ErrorKind {
    /// Stable string form used in API payloads and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Persistence => "persistence",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Transport => "transport",
            Self::Invalid => "invalid",
            Self::Busy => "busy",
        }
    }
}

impl TreeError {
    /// Build a `NotFound` error for an entity id.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Project the error onto its category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Persistence(_) | Self::Sqlite(_) | Self::TokioSqlite(_) | Self::Io(_) => {
                ErrorKind::Persistence
            }
            Self::ProviderRateLimited { .. } => ErrorKind::RateLimited,
            Self::ProviderQuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::ProviderTransport(_) | Self::Http(_) | Self::Serialization(_) => {
                ErrorKind::Transport
            }
            Self::StreamInProgress(_) => ErrorKind::Busy,
            Self::InvalidInput(_) | Self::InvalidConfig(_) | Self::Url(_) => ErrorKind::Invalid,
        }
    }

    /// Text suitable for a user-facing notification.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::NotFound => "That message or tangent no longer exists.".to_string(),
            ErrorKind::Persistence => "Failed to save your message. Please try again.".to_string(),
            ErrorKind::RateLimited => match self {
                Self::ProviderRateLimited {
                    retry_after_secs: Some(secs),
                    ..
                } => format!("Rate limit reached. Please wait {secs} seconds and try again."),
                _ => "Rate limit reached. Please wait a moment and try again.".to_string(),
            },
            ErrorKind::QuotaExceeded => {
                "The AI provider quota is exhausted. Add credits to continue.".to_string()
            }
            ErrorKind::Transport => "Failed to get a response from the AI. Please retry.".to_string(),
            ErrorKind::Invalid => self.to_string(),
            ErrorKind::Busy => "A reply is still being generated here.".to_string(),
        }
    }
}

/// Convenience result alias for tree operations.
pub type TreeResult<T> = Result<T, TreeError>;
