//! Document-context collaborator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tree::core::config::PromptConfig;
use crate::tree::core::errors::TreeResult;
use crate::tree::core::node::truncate_with_ellipsis;

/// Boxed future type for document lookups.
pub type DocumentFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One grounding passage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnippet {
    /// Display name of the source document.
    pub source_name: String,
    /// Passage text.
    pub content: String,
}

impl DocumentSnippet {
    /// Build a snippet.
    #[must_use]
    pub fn new(source_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            content: content.into(),
        }
    }
}

/// Source of grounding passages for a query.
pub trait DocumentContextProvider: Send + Sync {
    /// Fetch passages relevant to `query` within `scope`.
    ///
    /// # Errors
    /// Returns an error if the lookup fails. Callers treat failures as "no documents".
    fn fetch<'a>(
        &'a self,
        query: &'a str,
        scope: &'a str,
    ) -> DocumentFuture<'a, TreeResult<Vec<DocumentSnippet>>>;
}

/// Provider that never returns documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDocuments;

impl DocumentContextProvider for NoDocuments {
    fn fetch<'a>(
        &'a self,
        _query: &'a str,
        _scope: &'a str,
    ) -> DocumentFuture<'a, TreeResult<Vec<DocumentSnippet>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Fixed set of scoped passages matched by keyword overlap.
#[derive(Clone, Debug, Default)]
pub struct StaticDocuments {
    entries: Vec<(String, DocumentSnippet)>,
}

impl StaticDocuments {
    /// Empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a passage visible to `scope`.
    #[must_use]
    pub fn with(mut self, scope: impl Into<String>, snippet: DocumentSnippet) -> Self {
        self.entries.push((scope.into(), snippet));
        self
    }
}

impl DocumentContextProvider for StaticDocuments {
    fn fetch<'a>(
        &'a self,
        query: &'a str,
        scope: &'a str,
    ) -> DocumentFuture<'a, TreeResult<Vec<DocumentSnippet>>> {
        Box::pin(async move {
            let terms: Vec<String> = query
                .split(|c: char| !c.is_alphanumeric())
                .filter(|term| term.chars().count() > 3)
                .map(str::to_lowercase)
                .collect();

            let hits = self
                .entries
                .iter()
                .filter(|(entry_scope, _)| entry_scope == scope)
                .filter(|(_, snippet)| {
                    let haystack = snippet.content.to_lowercase();
                    terms.iter().any(|term| haystack.contains(term.as_str()))
                })
                .map(|(_, snippet)| snippet.clone())
                .collect();
            Ok(hits)
        })
    }
}

/// Fetch documents for a prompt, applying the configured limits.
///
/// A failing provider is logged and treated as returning nothing.
pub async fn gather_documents(
    provider: &Arc<dyn DocumentContextProvider>,
    query: &str,
    scope: &str,
    config: &PromptConfig,
) -> Vec<DocumentSnippet> {
    if config.max_documents == 0 || query.trim().is_empty() {
        return Vec::new();
    }

    match provider.fetch(query, scope).await {
        Ok(snippets) => {
            debug!("Document provider returned {} snippets", snippets.len());
            snippets
                .into_iter()
                .filter(|snippet| !snippet.content.trim().is_empty())
                .take(config.max_documents)
                .map(|snippet| DocumentSnippet {
                    content: truncate_with_ellipsis(&snippet.content, config.max_document_chars),
                    source_name: snippet.source_name,
                })
                .collect()
        }
        Err(err) => {
            warn!("Document lookup failed for scope {scope}, continuing without documents: {err}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::core::errors::TreeError;

    struct Broken;

    impl DocumentContextProvider for Broken {
        fn fetch<'a>(
            &'a self,
            _query: &'a str,
            _scope: &'a str,
        ) -> DocumentFuture<'a, TreeResult<Vec<DocumentSnippet>>> {
            Box::pin(async { Err(TreeError::Persistence("index offline".to_string())) })
        }
    }

    #[tokio::test]
    async fn failing_provider_yields_nothing() {
        let provider: Arc<dyn DocumentContextProvider> = Arc::new(Broken);
        let docs = gather_documents(&provider, "anything here", "scope", &PromptConfig::default()).await;
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn static_documents_match_by_scope_and_keyword() {
        let provider: Arc<dyn DocumentContextProvider> = Arc::new(
            StaticDocuments::new()
                .with("a", DocumentSnippet::new("drag.pdf", "Air resistance depends on velocity"))
                .with("a", DocumentSnippet::new("other.pdf", "Unrelated cooking notes"))
                .with("b", DocumentSnippet::new("drag-b.pdf", "Air resistance again")),
        );
        let docs = gather_documents(&provider, "What is air resistance?", "a", &PromptConfig::default()).await;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_name, "drag.pdf");
    }

    #[tokio::test]
    async fn limits_are_applied() {
        let long = "resistance ".repeat(50);
        let provider: Arc<dyn DocumentContextProvider> = Arc::new(
            StaticDocuments::new()
                .with("a", DocumentSnippet::new("1", long.clone()))
                .with("a", DocumentSnippet::new("2", long.clone()))
                .with("a", DocumentSnippet::new("3", long)),
        );
        let config = PromptConfig {
            max_documents: 2,
            max_document_chars: 20,
            ..PromptConfig::default()
        };
        let docs = gather_documents(&provider, "resistance", "a", &config).await;
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|doc| doc.content.chars().count() <= 23));
    }

    #[tokio::test]
    async fn no_documents_is_empty() {
        let provider: Arc<dyn DocumentContextProvider> = Arc::new(NoDocuments);
        assert!(gather_documents(&provider, "query text", "s", &PromptConfig::default()).await.is_empty());
    }
}
