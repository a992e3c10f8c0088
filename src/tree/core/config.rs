//! Configuration for the conversation tree engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::tree::core::errors::{TreeError, TreeResult};

/// Default system prompt sent ahead of every assembled context.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. CRITICAL FORMATTING RULES:\n\n\
**Main Formulas (MUST be centered):**\n\
- ALWAYS put main formulas on their own line surrounded by blank lines\n\
- Use $$...$$ delimiters (double dollar signs)\n\n\
**Variables in text:**\n\
- Use $...$ for inline variables and symbols\n\n\
**NEVER:**\n\
- Write formulas as plain text\n\
- Use single $ for block equations";

/// Top-level configuration for the tree engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Completion provider settings.
    pub provider: ProviderConfig,
    /// Prompt construction settings.
    pub prompt: PromptConfig,
    /// Branch display settings.
    pub branch: BranchConfig,
    /// Open-conversation cache settings.
    pub sessions: SessionConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
}

impl TreeConfig {
    /// Build the default config overlaid with `TANGENT_*` environment variables.
    ///
    /// # Errors
    /// Returns an error if an override cannot be parsed or the result is invalid.
    pub fn from_env() -> TreeResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("TANGENT_DB_PATH") {
            config.storage.sqlite_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("TANGENT_PROVIDER_URL") {
            config.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("TANGENT_MODEL") {
            config.provider.model = model;
        }
        config.provider.api_key = std::env::var("TANGENT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        if let Ok(max_open) = std::env::var("TANGENT_MAX_OPEN_SESSIONS") {
            config.sessions.max_open = max_open.parse().map_err(|_| {
                TreeError::InvalidConfig(format!("TANGENT_MAX_OPEN_SESSIONS={max_open}"))
            })?;
        }
        if let Ok(port) = std::env::var("TANGENT_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| TreeError::InvalidConfig(format!("TANGENT_PORT={port}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> TreeResult<()> {
        if self.provider.model.trim().is_empty() {
            return Err(TreeError::InvalidConfig(
                "provider.model must not be empty".to_string(),
            ));
        }

        if self.provider.connect_timeout_secs == 0 || self.provider.request_timeout_secs == 0 {
            return Err(TreeError::InvalidConfig(
                "provider timeouts must be > 0".to_string(),
            ));
        }

        if self.branch.preview_chars == 0 {
            return Err(TreeError::InvalidConfig(
                "branch.preview_chars must be > 0".to_string(),
            ));
        }

        if self.branch.fork_label_chars == 0 {
            return Err(TreeError::InvalidConfig(
                "branch.fork_label_chars must be > 0".to_string(),
            ));
        }

        if self.branch.title_chars == 0 {
            return Err(TreeError::InvalidConfig(
                "branch.title_chars must be > 0".to_string(),
            ));
        }

        if self.sessions.max_open == 0 {
            return Err(TreeError::InvalidConfig(
                "sessions.max_open must be > 0".to_string(),
            ));
        }

        Url::parse(&self.provider.base_url)?;

        Ok(())
    }
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
    /// Conversation table name.
    pub conversations_table: String,
    /// Node table name.
    pub nodes_table: String,
    /// Tangent table name.
    pub tangents_table: String,
    /// Tangent turn table name.
    pub tangent_turns_table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("tangent_tree.sqlite"),
            conversations_table: "conversations".to_string(),
            nodes_table: "nodes".to_string(),
            tangents_table: "tangents".to_string(),
            tangent_turns_table: "tangent_turns".to_string(),
        }
    }
}

/// Completion provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Bearer token; never written back out.
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout, streaming included.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 300,
        }
    }
}

/// Prompt construction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptConfig {
    /// System prompt prepended to every request.
    pub system_prompt: String,
    /// Whether to tell the model where it sits in the tree.
    pub include_branch_hints: bool,
    /// Maximum number of document excerpts to include.
    pub max_documents: usize,
    /// Maximum size of one document excerpt in characters.
    pub max_document_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            include_branch_hints: true,
            max_documents: 5,
            max_document_chars: 2000,
        }
    }
}

/// Branch display settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Length of the `BranchInfo::preview` prefix.
    pub preview_chars: usize,
    /// Length of the user message prefix used in default fork labels.
    pub fork_label_chars: usize,
    /// Title of freshly created conversations.
    pub default_title: String,
    /// Length of the auto-generated conversation title.
    pub title_chars: usize,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            preview_chars: 50,
            fork_label_chars: 20,
            default_title: "New Chat".to_string(),
            title_chars: 30,
        }
    }
}

/// Open-conversation cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Loaded conversations kept in memory before idle ones are evicted.
    pub max_open: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_open: 256 }
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TreeConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_model_is_rejected() {
        let mut config = TreeConfig::default();
        config.provider.model = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(TreeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let mut config = TreeConfig::default();
        config.provider.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(TreeError::Url(_))));
    }

    #[test]
    fn zero_session_cache_is_rejected() {
        let mut config = TreeConfig::default();
        config.sessions.max_open = 0;
        assert!(matches!(
            config.validate(),
            Err(TreeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn api_key_is_not_serialized() {
        let mut config = TreeConfig::default();
        config.provider.api_key = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap_or_default();
        assert!(!json.contains("secret"));
    }
}
