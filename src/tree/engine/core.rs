//! Conversation tree engine orchestration.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::{CompletionProvider, OpenAiCompatProvider};
use crate::tree::context::{
    AssembledContext, DocumentContextProvider, NoDocuments, PromptBuilder, assemble_for_node,
    assemble_for_tangent, gather_documents,
};
use crate::tree::controller::{ActiveNode, BranchController, TangentController};
use crate::tree::core::config::TreeConfig;
use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{ConversationId, MessageId, NodeId, TangentId};
use crate::tree::core::node::{BranchInfo, Node, truncate_with_ellipsis};
use crate::tree::core::tangent::Tangent;
use crate::tree::engine::in_flight::{InFlightGuard, InFlightRegistry};
use crate::tree::storage::{
    ConversationMeta, ConversationStore, MemoryStore, NodeStore, SqliteBackends, TangentForest,
    TangentStore,
};
use crate::tree::stream::{StreamSummary, StreamTarget, StreamingSession};

/// Backend dependencies for the tree engine.
pub struct TreeBackends {
    /// Conversation metadata store.
    pub conversations: Arc<dyn ConversationStore>,
    /// Node store.
    pub nodes: Arc<dyn NodeStore>,
    /// Tangent store.
    pub tangents: Arc<dyn TangentStore>,
    /// Completion provider.
    pub provider: Arc<dyn CompletionProvider>,
    /// Document-context collaborator.
    pub documents: Arc<dyn DocumentContextProvider>,
}

impl TreeBackends {
    /// Build `SQLite` stores and the HTTP provider from config.
    ///
    /// # Errors
    /// Returns an error if the database or the HTTP client cannot be initialized.
    pub async fn sqlite(config: &TreeConfig) -> TreeResult<Self> {
        let stores = SqliteBackends::open(&config.storage).await?;
        let provider = Arc::new(OpenAiCompatProvider::new(&config.provider)?);
        Ok(Self {
            conversations: stores.conversations,
            nodes: stores.nodes,
            tangents: stores.tangents,
            provider,
            documents: Arc::new(NoDocuments),
        })
    }

    /// Volatile stores around the given provider.
    #[must_use]
    pub fn in_memory(provider: Arc<dyn CompletionProvider>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            conversations: Arc::clone(&store) as Arc<dyn ConversationStore>,
            nodes: Arc::clone(&store) as Arc<dyn NodeStore>,
            tangents: store,
            provider,
            documents: Arc::new(NoDocuments),
        }
    }

    /// Replace the document-context collaborator.
    #[must_use]
    pub fn with_documents(mut self, documents: Arc<dyn DocumentContextProvider>) -> Self {
        self.documents = documents;
        self
    }
}

/// Live state of one open conversation.
pub struct ConversationSession {
    /// Node tree and active node.
    pub branches: BranchController,
    /// Tangent forests.
    pub tangents: TangentController,
    closed: bool,
}

/// One node of the active path with its sibling choices.
#[derive(Clone, Debug, Serialize)]
pub struct PathEntry {
    /// The node on the path.
    pub node: Node,
    /// Siblings including the node itself; a branch chooser is only shown when
    /// there is more than one.
    pub siblings: Vec<BranchInfo>,
}

/// Everything the UI renders for a conversation.
#[derive(Clone, Debug, Serialize)]
pub struct ConversationView {
    /// Conversation metadata.
    pub conversation: ConversationMeta,
    /// Active node state.
    pub active: ActiveNode,
    /// Root-first active path.
    pub path: Vec<PathEntry>,
}

/// Per-conversation orchestration of the tree, tangents and streaming replies.
pub struct TreeEngine {
    config: TreeConfig,
    conversations: Arc<dyn ConversationStore>,
    nodes: Arc<dyn NodeStore>,
    tangents: Arc<dyn TangentStore>,
    documents: Arc<dyn DocumentContextProvider>,
    streaming: StreamingSession,
    prompt: PromptBuilder,
    sessions: DashMap<ConversationId, Arc<Mutex<ConversationSession>>>,
    in_flight: InFlightRegistry,
}

impl TreeEngine {
    /// Create a new engine.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: TreeConfig, backends: TreeBackends) -> TreeResult<Self> {
        config.validate()?;
        Ok(Self {
            prompt: PromptBuilder::new(config.prompt.clone()),
            streaming: StreamingSession::new(backends.provider),
            conversations: backends.conversations,
            nodes: backends.nodes,
            tangents: backends.tangents,
            documents: backends.documents,
            sessions: DashMap::new(),
            in_flight: InFlightRegistry::new(),
            config,
        })
    }

    /// Create an engine over `SQLite` backends.
    ///
    /// # Errors
    /// Returns an error if backends cannot be initialized.
    pub async fn from_config(config: TreeConfig) -> TreeResult<Self> {
        let backends = TreeBackends::sqlite(&config).await?;
        Self::new(config, backends)
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Model used for replies.
    #[must_use]
    pub fn model(&self) -> &str {
        self.streaming.model()
    }

    // ===== Conversations =====================================================

    /// Create a conversation, titled "New Chat" unless a title is given.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    pub async fn create_conversation(&self, title: Option<String>) -> TreeResult<ConversationMeta> {
        let now = Utc::now();
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.config.branch.default_title.clone());
        let meta = ConversationMeta {
            id: ConversationId::new(),
            title,
            created_at: now,
            updated_at: now,
        };
        self.conversations.create(meta.clone()).await?;
        info!("Created conversation {} ({})", meta.id, meta.title);
        Ok(meta)
    }

    /// All conversations, most recently active first.
    ///
    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn list_conversations(&self) -> TreeResult<Vec<ConversationMeta>> {
        let mut all = self.conversations.list_all().await?;
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    /// Look up one conversation.
    ///
    /// # Errors
    /// Returns `NotFound` if the conversation does not exist.
    pub async fn conversation(&self, id: ConversationId) -> TreeResult<ConversationMeta> {
        self.conversations
            .get_by_id(id)
            .await?
            .ok_or_else(|| TreeError::not_found("conversation", id))
    }

    /// Rename a conversation.
    ///
    /// # Errors
    /// Returns `InvalidInput` for a blank title, `NotFound` for an unknown id.
    pub async fn rename_conversation(
        &self,
        id: ConversationId,
        title: String,
    ) -> TreeResult<ConversationMeta> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(TreeError::InvalidInput("title must not be empty".to_string()));
        }
        self.conversation(id).await?;
        self.conversations.update_title(id, title).await?;
        self.conversations.touch_updated(id, Utc::now()).await?;
        self.conversation(id).await
    }

    /// Delete a conversation with all its nodes, tangents and tangent turns.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id, `StreamInProgress` while any reply in
    /// the conversation is still streaming, or a store error.
    pub async fn delete_conversation(&self, id: ConversationId) -> TreeResult<()> {
        let session = self.session(id).await?;
        let mut state = lock_open(id, &session).await?;
        if let Some(target) = self.in_flight.busy_in(id) {
            warn!("Refusing to delete conversation {id} while {target} is streaming");
            return Err(TreeError::StreamInProgress(target.to_string()));
        }

        self.tangents.delete_by_conversation(id).await?;
        self.nodes.delete_by_conversation(id).await?;
        self.conversations.delete(id).await?;
        state.closed = true;
        self.sessions.remove(&id);
        info!("Deleted conversation {id}");
        Ok(())
    }

    // ===== Branch operations =================================================

    /// Send `text` as a child of the active node and stream the reply.
    ///
    /// # Errors
    /// Returns `InvalidInput` for blank text, `StreamInProgress` while the active
    /// node's own reply is still streaming, persistence errors from creating the
    /// node, and provider errors from the stream (partial text is kept).
    pub async fn send_message<D>(
        &self,
        conversation_id: ConversationId,
        text: String,
        on_delta: D,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamSummary>
    where
        D: FnMut(&str) + Send,
    {
        let text = require_text(text)?;
        let session = self.session(conversation_id).await?;

        let (guard, context, first_node) = {
            let mut state = lock_open(conversation_id, &session).await?;
            let parent = state.branches.active().node_id();
            self.ensure_parent_settled(parent)?;

            let node_id = state.branches.create_node(text.clone(), parent, None).await?;
            let guard = self
                .in_flight
                .acquire(conversation_id, StreamTarget::Node(node_id))?;
            let context = assemble_for_node(state.branches.arena(), &node_id)?;
            (guard, context, state.branches.arena().len() == 1)
        };

        if first_node {
            self.auto_title(conversation_id, &text).await;
        }
        self.stream_reply(conversation_id, session, guard, context, on_delta, cancel)
            .await
    }

    /// Fork a sibling of `node_id` with `text` and stream its reply.
    ///
    /// # Errors
    /// Returns `InvalidInput` for blank text, `NotFound` for an unknown node,
    /// `StreamInProgress` while the shared parent's reply is still streaming,
    /// persistence errors, and provider errors from the stream.
    pub async fn fork_from_node<D>(
        &self,
        conversation_id: ConversationId,
        node_id: NodeId,
        text: String,
        branch_name: Option<String>,
        on_delta: D,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamSummary>
    where
        D: FnMut(&str) + Send,
    {
        let text = require_text(text)?;
        let session = self.session(conversation_id).await?;

        let (guard, context) = {
            let mut state = lock_open(conversation_id, &session).await?;
            let parent = state.branches.node(&node_id).and_then(|node| node.parent_id);
            self.ensure_parent_settled(parent)?;

            let fork_id = state.branches.fork_from_node(node_id, text, branch_name).await?;
            let guard = self
                .in_flight
                .acquire(conversation_id, StreamTarget::Node(fork_id))?;
            let context = assemble_for_node(state.branches.arena(), &fork_id)?;
            (guard, context)
        };

        self.stream_reply(conversation_id, session, guard, context, on_delta, cancel)
            .await
    }

    /// Make `node_id` active and return the new active path.
    ///
    /// Unknown ids leave the active node unchanged.
    ///
    /// # Errors
    /// Returns `NotFound` if the conversation does not exist, or a store error while
    /// loading it.
    pub async fn switch_to_branch(
        &self,
        conversation_id: ConversationId,
        node_id: NodeId,
    ) -> TreeResult<Vec<PathEntry>> {
        let session = self.session(conversation_id).await?;
        let mut state = lock_open(conversation_id, &session).await?;
        state.branches.switch_to_branch(node_id);
        Ok(self.path_entries(&state.branches))
    }

    /// Root-first active path with sibling lists.
    ///
    /// # Errors
    /// Returns `NotFound` if the conversation does not exist.
    pub async fn active_path(&self, conversation_id: ConversationId) -> TreeResult<Vec<PathEntry>> {
        let session = self.session(conversation_id).await?;
        let state = lock_open(conversation_id, &session).await?;
        Ok(self.path_entries(&state.branches))
    }

    /// Conversation metadata, active node and active path.
    ///
    /// # Errors
    /// Returns `NotFound` if the conversation does not exist.
    pub async fn view(&self, conversation_id: ConversationId) -> TreeResult<ConversationView> {
        let conversation = self.conversation(conversation_id).await?;
        let session = self.session(conversation_id).await?;
        let state = lock_open(conversation_id, &session).await?;
        Ok(ConversationView {
            conversation,
            active: state.branches.active(),
            path: self.path_entries(&state.branches),
        })
    }

    // ===== Tangent operations ================================================

    /// Open a tangent on `message_id`'s reply and stream the first answer.
    ///
    /// # Errors
    /// Returns `InvalidInput` for blank text or highlight, `NotFound` for an unknown
    /// message, persistence errors, and provider errors from the stream.
    pub async fn create_tangent<D>(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        highlighted_text: String,
        text: String,
        on_delta: D,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamSummary>
    where
        D: FnMut(&str) + Send,
    {
        let text = require_text(text)?;
        let highlighted_text = require_highlight(highlighted_text)?;
        let session = self.session(conversation_id).await?;

        let (guard, context) = {
            let mut state = lock_open(conversation_id, &session).await?;
            let Some(message) = state.branches.node(&message_id) else {
                warn!("Tangent requested on unknown message {message_id}");
                return Err(TreeError::not_found("node", message_id));
            };
            let anchored = message
                .assistant_response
                .as_deref()
                .is_some_and(|response| response.contains(highlighted_text.as_str()));
            if !anchored {
                debug!("Highlighted text is not part of message {message_id}'s reply");
            }

            let tangent_id = state
                .tangents
                .create_tangent(message_id, highlighted_text, text)
                .await?;
            let guard = self
                .in_flight
                .acquire(conversation_id, StreamTarget::Tangent(tangent_id))?;
            let context = Self::tangent_context(&state, tangent_id)?;
            (guard, context)
        };

        self.stream_reply(conversation_id, session, guard, context, on_delta, cancel)
            .await
    }

    /// Append `text` to an existing tangent and stream the answer into it.
    ///
    /// # Errors
    /// Returns `InvalidInput` for blank text, `StreamInProgress` while the tangent
    /// is already answering, `NotFound` for an unknown tangent, persistence errors,
    /// and provider errors from the stream.
    pub async fn reply_to_tangent<D>(
        &self,
        conversation_id: ConversationId,
        tangent_id: TangentId,
        text: String,
        on_delta: D,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamSummary>
    where
        D: FnMut(&str) + Send,
    {
        let text = require_text(text)?;
        let session = self.session(conversation_id).await?;

        let (guard, context) = {
            let mut state = lock_open(conversation_id, &session).await?;
            let guard = self
                .in_flight
                .acquire(conversation_id, StreamTarget::Tangent(tangent_id))?;
            state.tangents.reply_to_tangent(tangent_id, text).await?;
            let context = Self::tangent_context(&state, tangent_id)?;
            (guard, context)
        };

        self.stream_reply(conversation_id, session, guard, context, on_delta, cancel)
            .await
    }

    /// Open a tangent on a span of `parent_tangent_id`'s conversation and stream the
    /// first answer.
    ///
    /// # Errors
    /// Returns `InvalidInput` for blank text or highlight, `NotFound` for an unknown
    /// parent, persistence errors, and provider errors from the stream.
    pub async fn create_sub_tangent<D>(
        &self,
        conversation_id: ConversationId,
        parent_tangent_id: TangentId,
        highlighted_text: String,
        text: String,
        on_delta: D,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamSummary>
    where
        D: FnMut(&str) + Send,
    {
        let text = require_text(text)?;
        let highlighted_text = require_highlight(highlighted_text)?;
        let session = self.session(conversation_id).await?;

        let (guard, context) = {
            let mut state = lock_open(conversation_id, &session).await?;
            let tangent_id = state
                .tangents
                .create_sub_tangent(parent_tangent_id, highlighted_text, text)
                .await?;
            let guard = self
                .in_flight
                .acquire(conversation_id, StreamTarget::Tangent(tangent_id))?;
            let context = Self::tangent_context(&state, tangent_id)?;
            (guard, context)
        };

        self.stream_reply(conversation_id, session, guard, context, on_delta, cancel)
            .await
    }

    /// Nested tangents anchored to `message_id`.
    ///
    /// # Errors
    /// Returns `NotFound` if the conversation or message does not exist.
    pub async fn tangents(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> TreeResult<Vec<Tangent>> {
        let session = self.session(conversation_id).await?;
        let state = lock_open(conversation_id, &session).await?;
        if state.branches.node(&message_id).is_none() {
            return Err(TreeError::not_found("node", message_id));
        }
        Ok(state.tangents.tangents_for(&message_id))
    }

    // ===== Internals =========================================================

    async fn session(&self, id: ConversationId) -> TreeResult<Arc<Mutex<ConversationSession>>> {
        if let Some(existing) = self.sessions.get(&id) {
            return Ok(Arc::clone(existing.value()));
        }

        self.conversation(id).await?;
        let branches =
            BranchController::load(id, Arc::clone(&self.nodes), self.config.branch.clone()).await?;
        let tangents = TangentController::load(id, Arc::clone(&self.tangents)).await?;
        let loaded = Arc::new(Mutex::new(ConversationSession {
            branches,
            tangents,
            closed: false,
        }));

        if self.sessions.len() >= self.config.sessions.max_open {
            self.evict_idle_sessions();
        }
        let session = Arc::clone(self.sessions.entry(id).or_insert(loaded).value());
        Ok(session)
    }

    /// Drop cached sessions nobody is using; they reload from the stores on demand.
    ///
    /// Busy sessions stay, so the cache can briefly exceed its limit.
    fn evict_idle_sessions(&self) {
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            Arc::strong_count(session) > 1 || self.in_flight.busy_in(*id).is_some()
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            debug!("Evicted {evicted} idle conversation sessions");
        }
    }

    fn ensure_parent_settled(&self, parent: Option<NodeId>) -> TreeResult<()> {
        match parent.map(StreamTarget::Node) {
            Some(target) if self.in_flight.contains(&target) => {
                Err(TreeError::StreamInProgress(target.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn path_entries(&self, branches: &BranchController) -> Vec<PathEntry> {
        branches
            .active_path()
            .into_iter()
            .map(|node| PathEntry {
                siblings: branches.siblings(&node.id),
                node: node.clone(),
            })
            .collect()
    }

    fn tangent_context(state: &ConversationSession, tangent_id: TangentId) -> TreeResult<AssembledContext> {
        let message_id = state
            .tangents
            .message_of(&tangent_id)
            .ok_or_else(|| TreeError::not_found("tangent", tangent_id))?;
        let forest: &TangentForest = state
            .tangents
            .forest(&message_id)
            .ok_or_else(|| TreeError::not_found("tangent", tangent_id))?;
        assemble_for_tangent(state.branches.arena(), forest, &tangent_id)
    }

    async fn auto_title(&self, id: ConversationId, first_message: &str) {
        let meta = match self.conversations.get_by_id(id).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return,
            Err(err) => {
                warn!("Could not read conversation {id} for auto-title: {err}");
                return;
            }
        };
        if meta.title != self.config.branch.default_title {
            return;
        }

        let title = truncate_with_ellipsis(first_message.trim(), self.config.branch.title_chars);
        match self.conversations.update_title(id, title.clone()).await {
            Ok(()) => debug!("Titled conversation {id} \"{title}\""),
            Err(err) => warn!("Failed to auto-title conversation {id}: {err}"),
        }
    }

    async fn stream_reply<D>(
        &self,
        conversation_id: ConversationId,
        session: Arc<Mutex<ConversationSession>>,
        guard: InFlightGuard,
        context: AssembledContext,
        on_delta: D,
        cancel: &CancellationToken,
    ) -> TreeResult<StreamSummary>
    where
        D: FnMut(&str) + Send,
    {
        let target = guard.target();
        self.touch(conversation_id).await;

        let query = context.latest_user_text().unwrap_or_default().to_string();
        let scope = conversation_id.to_string();
        let documents =
            gather_documents(&self.documents, &query, &scope, &self.config.prompt).await;
        let messages = self.prompt.build(context, &documents);

        let commit = move |text: String| async move {
            if text.is_empty() {
                return Ok(());
            }
            let mut state = session.lock().await;
            match target {
                StreamTarget::Node(node_id) => {
                    state.branches.update_node_response(node_id, text).await
                }
                StreamTarget::Tangent(tangent_id) => state
                    .tangents
                    .append_assistant_reply(tangent_id, text)
                    .await
                    .map(|_| ()),
            }
        };

        let result = self
            .streaming
            .run(target, messages, on_delta, commit, cancel)
            .await;
        drop(guard);
        self.touch(conversation_id).await;
        result
    }

    async fn touch(&self, id: ConversationId) {
        if let Err(err) = self.conversations.touch_updated(id, Utc::now()).await {
            warn!("Failed to touch conversation {id}: {err}");
        }
    }
}

async fn lock_open(
    id: ConversationId,
    session: &Mutex<ConversationSession>,
) -> TreeResult<MutexGuard<'_, ConversationSession>> {
    let state = session.lock().await;
    if state.closed {
        debug!("Conversation {id} was deleted while waiting for its session");
        return Err(TreeError::not_found("conversation", id));
    }
    Ok(state)
}

fn require_text(text: String) -> TreeResult<String> {
    if text.trim().is_empty() {
        return Err(TreeError::InvalidInput("message must not be empty".to_string()));
    }
    Ok(text)
}

fn require_highlight(text: String) -> TreeResult<String> {
    if text.trim().is_empty() {
        return Err(TreeError::InvalidInput(
            "highlighted text must not be empty".to_string(),
        ));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;
    use crate::llm::ChatRole;
    use crate::tree::context::{DocumentSnippet, StaticDocuments};
    use crate::tree::core::config::StorageConfig;
    use crate::tree::core::errors::ErrorKind;
    use crate::tree::stream::StreamOutcome;
    use crate::tree::stream::scripted::{Script, ScriptedProvider};

    fn engine_with(provider: &Arc<ScriptedProvider>) -> TreeEngine {
        let provider: Arc<dyn CompletionProvider> = Arc::clone(provider) as Arc<dyn CompletionProvider>;
        TreeEngine::new(TreeConfig::default(), TreeBackends::in_memory(provider)).unwrap()
    }

    fn tangent_id(summary: &StreamSummary) -> TangentId {
        match summary.target {
            StreamTarget::Tangent(id) => id,
            StreamTarget::Node(_) => panic!("expected a tangent target"),
        }
    }

    fn node_id(summary: &StreamSummary) -> NodeId {
        match summary.target {
            StreamTarget::Node(id) => id,
            StreamTarget::Tangent(_) => panic!("expected a node target"),
        }
    }

    async fn send(engine: &TreeEngine, conv: ConversationId, text: &str) -> TreeResult<StreamSummary> {
        engine
            .send_message(conv, text.to_string(), |_| {}, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn send_message_streams_and_persists_reply() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["Hel", "lo"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();
        assert_eq!(conv.title, "New Chat");

        let mut deltas = Vec::new();
        let summary = engine
            .send_message(
                conv.id,
                "Hi".to_string(),
                |piece| deltas.push(piece.to_string()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(summary.text, "Hello");
        let path = engine.active_path(conv.id).await.unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].node.assistant_response.as_deref(), Some("Hello"));
        assert_eq!(path[0].siblings.len(), 1);
        assert_eq!(engine.conversation(conv.id).await.unwrap().title, "Hi");
    }

    #[tokio::test]
    async fn prompt_carries_system_block_and_path_only() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["Hello"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();

        send(&engine, conv.id, "Hi").await.unwrap();
        send(&engine, conv.id, "More").await.unwrap();

        let request = provider.last_request();
        let roles: Vec<ChatRole> = request.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
        assert!(request[0].content.contains("2 turns deep"));
        assert_eq!(request[3].content, "More");
    }

    #[tokio::test]
    async fn fork_from_root_scenario() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["Hello"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();

        let root = node_id(&send(&engine, conv.id, "Hi").await.unwrap());
        let fork = engine
            .fork_from_node(
                conv.id,
                root,
                "Tell me about X".to_string(),
                Some("X-exploration".to_string()),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let fork = node_id(&fork);

        let path = engine.active_path(conv.id).await.unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].node.id, fork);
        assert_eq!(path[0].node.parent_id, None);
        let siblings: Vec<NodeId> = path[0].siblings.iter().map(|s| s.id).collect();
        assert_eq!(siblings, vec![root, fork]);

        let request = provider.last_request();
        assert!(request.iter().all(|m| m.content != "Hi"));

        let switched = engine.switch_to_branch(conv.id, root).await.unwrap();
        assert_eq!(switched[0].node.id, root);
        let unchanged = engine.switch_to_branch(conv.id, NodeId::new()).await.unwrap();
        assert_eq!(unchanged[0].node.id, root);
    }

    #[tokio::test]
    async fn transport_failure_keeps_partial_reply() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["unused"])));
        provider.enqueue(Script::fail_after(&["par", "tial"], "reset by peer"));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();

        let err = send(&engine, conv.id, "Hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let path = engine.active_path(conv.id).await.unwrap();
        assert_eq!(path[0].node.assistant_response.as_deref(), Some("partial"));
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_and_quota_surface_distinctly() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["ok"])));
        provider.enqueue(Script::RateLimited(Some(30)));
        provider.enqueue(Script::QuotaExceeded);
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();

        let limited = send(&engine, conv.id, "Hi").await.unwrap_err();
        assert_eq!(limited.kind(), ErrorKind::RateLimited);
        let quota = send(&engine, conv.id, "Again").await.unwrap_err();
        assert_eq!(quota.kind(), ErrorKind::QuotaExceeded);

        let path = engine.active_path(conv.id).await.unwrap();
        assert_eq!(path.len(), 2);
        assert!(path.iter().all(|entry| entry.node.assistant_response.is_none()));
    }

    #[tokio::test]
    async fn cancelled_stream_commits_what_arrived() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["first ", "second"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let summary = engine
            .send_message(conv.id, "Hi".to_string(), move |_| trigger.cancel(), &cancel)
            .await
            .unwrap();

        assert_eq!(summary.outcome, StreamOutcome::Cancelled);
        let path = engine.active_path(conv.id).await.unwrap();
        assert_eq!(path[0].node.assistant_response.as_deref(), Some("first "));
    }

    #[tokio::test]
    async fn tangent_threads_nest_and_reply_in_place() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["X relates to Y"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();
        let message = node_id(&send(&engine, conv.id, "Explain X").await.unwrap());
        let cancel = CancellationToken::new();

        provider.enqueue(Script::reply(&["Because of Z"]));
        let t1 = engine
            .create_tangent(conv.id, message, "Y".to_string(), "re: Y".to_string(), |_| {}, &cancel)
            .await
            .unwrap();
        let t1 = tangent_id(&t1);

        let t2 = engine
            .create_sub_tangent(conv.id, t1, "Z".to_string(), "thoughts".to_string(), |_| {}, &cancel)
            .await
            .unwrap();
        let t2 = tangent_id(&t2);

        engine
            .reply_to_tangent(conv.id, t2, "more".to_string(), |_| {}, &cancel)
            .await
            .unwrap();

        let tree = engine.tangents(conv.id, message).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, t1);
        assert_eq!(tree[0].conversation.len(), 2);
        assert_eq!(tree[0].conversation[1].content, "Because of Z");
        let nested = &tree[0].sub_tangents[0];
        assert_eq!(nested.id, t2);
        let contents: Vec<&str> = nested.conversation.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["thoughts", "X relates to Y", "more", "X relates to Y"]);

        let request = provider.last_request();
        assert!(request.iter().any(|m| m.content == "Tangent on highlighted text: \"Y\""));
        assert!(request.iter().any(|m| m.content == "Tangent on highlighted text: \"Z\""));
        assert!(request[0].content.contains("2 levels deep"));
    }

    #[tokio::test]
    async fn unknown_targets_are_not_found() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["ok"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();
        let cancel = CancellationToken::new();

        let err = send(&engine, ConversationId::new(), "Hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = engine
            .create_tangent(conv.id, NodeId::new(), "x".into(), "y".into(), |_| {}, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = engine
            .reply_to_tangent(conv.id, TangentId::new(), "y".into(), |_| {}, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(engine.in_flight.is_empty());
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn blank_input_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["ok"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();

        let err = send(&engine, conv.id, "   ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let err = engine.rename_conversation(conv.id, " ".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(engine.active_path(conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_targets_are_rejected() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(ScriptedProvider::gated(Script::reply(&["ok"]), Arc::clone(&gate)));
        let engine = Arc::new(engine_with(&provider));
        let conv = engine.create_conversation(None).await.unwrap();

        gate.notify_one();
        let message = node_id(&send(&engine, conv.id, "Hi").await.unwrap());
        gate.notify_one();
        let tangent = engine
            .create_tangent(conv.id, message, "ok".into(), "why?".into(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        let tangent = tangent_id(&tangent);

        let background = Arc::clone(&engine);
        let pending = tokio::spawn(async move {
            background
                .reply_to_tangent(conv.id, tangent, "first".into(), |_| {}, &CancellationToken::new())
                .await
        });
        while engine.in_flight.is_empty() {
            tokio::task::yield_now().await;
        }

        let err = engine
            .reply_to_tangent(conv.id, tangent, "second".into(), |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert!(engine.in_flight.is_empty());
    }

    #[tokio::test]
    async fn sessions_reload_from_stores_and_delete_cascades() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["Hello"])));
        let store = Arc::new(MemoryStore::new());
        let backends = || TreeBackends {
            conversations: Arc::clone(&store) as Arc<dyn ConversationStore>,
            nodes: Arc::clone(&store) as Arc<dyn NodeStore>,
            tangents: Arc::clone(&store) as Arc<dyn TangentStore>,
            provider: Arc::clone(&provider) as Arc<dyn CompletionProvider>,
            documents: Arc::new(NoDocuments),
        };

        let first = TreeEngine::new(TreeConfig::default(), backends()).unwrap();
        let conv = first.create_conversation(Some("Physics".to_string())).await.unwrap();
        let root = node_id(&send(&first, conv.id, "Hi").await.unwrap());
        let leaf = node_id(&send(&first, conv.id, "Drag?").await.unwrap());
        first.switch_to_branch(conv.id, root).await.unwrap();

        let second = TreeEngine::new(TreeConfig::default(), backends()).unwrap();
        let view = second.view(conv.id).await.unwrap();
        assert_eq!(view.conversation.title, "Physics");
        assert_eq!(view.active, ActiveNode::Active(leaf));
        assert_eq!(view.path.len(), 2);

        second.delete_conversation(conv.id).await.unwrap();
        assert_eq!(second.view(conv.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        let nodes = NodeStore::load_by_conversation(store.as_ref(), conv.id).await.unwrap();
        assert!(nodes.is_empty());
        assert!(second.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn documents_for_the_conversation_reach_the_system_block() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["Hello"])));
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let conv = ConversationId::new();
        ConversationStore::create(
            store.as_ref(),
            ConversationMeta {
                id: conv,
                title: "Physics".to_string(),
                created_at: now,
                updated_at: now,
            },
        )
        .await
        .unwrap();

        let documents = StaticDocuments::new().with(
            conv.to_string(),
            DocumentSnippet::new("notes.md", "Drag grows with velocity squared"),
        );
        let backends = TreeBackends {
            conversations: Arc::clone(&store) as Arc<dyn ConversationStore>,
            nodes: Arc::clone(&store) as Arc<dyn NodeStore>,
            tangents: Arc::clone(&store) as Arc<dyn TangentStore>,
            provider: Arc::clone(&provider) as Arc<dyn CompletionProvider>,
            documents: Arc::new(NoDocuments),
        }
        .with_documents(Arc::new(documents));
        let engine = TreeEngine::new(TreeConfig::default(), backends).unwrap();

        send(&engine, conv, "Why does drag matter?").await.unwrap();
        let request = provider.last_request();
        let system = &request[0];
        assert_eq!(system.role, ChatRole::System);
        assert!(system.content.contains("[DOCUMENTS]"));
        assert!(system.content.contains("* (notes.md) Drag grows with velocity squared"));

        let other = engine.create_conversation(None).await.unwrap();
        send(&engine, other.id, "Why does drag matter?").await.unwrap();
        assert!(!provider.last_request()[0].content.contains("[DOCUMENTS]"));
    }

    #[tokio::test]
    async fn delete_is_refused_while_a_reply_streams() {
        let gate = Arc::new(Notify::new());
        let provider = Arc::new(ScriptedProvider::gated(Script::reply(&["ok"]), Arc::clone(&gate)));
        let stores = SqliteBackends::in_memory(&StorageConfig::default()).await.unwrap();
        let tangent_store = Arc::clone(&stores.tangents);
        let backends = TreeBackends {
            conversations: stores.conversations,
            nodes: stores.nodes,
            tangents: stores.tangents,
            provider: Arc::clone(&provider) as Arc<dyn CompletionProvider>,
            documents: Arc::new(NoDocuments),
        };
        let engine = Arc::new(TreeEngine::new(TreeConfig::default(), backends).unwrap());
        let conv = engine.create_conversation(None).await.unwrap();

        gate.notify_one();
        let message = node_id(&send(&engine, conv.id, "Hi").await.unwrap());
        gate.notify_one();
        let tangent = engine
            .create_tangent(conv.id, message, "ok".into(), "why?".into(), |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        let tangent = tangent_id(&tangent);

        let background = Arc::clone(&engine);
        let pending = tokio::spawn(async move {
            background
                .reply_to_tangent(conv.id, tangent, "and then?".into(), |_| {}, &CancellationToken::new())
                .await
        });
        while engine.in_flight.is_empty() {
            tokio::task::yield_now().await;
        }

        let err = engine.delete_conversation(conv.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(engine.conversation(conv.id).await.is_ok());

        gate.notify_one();
        pending.await.unwrap().unwrap();
        let tree = engine.tangents(conv.id, message).await.unwrap();
        assert_eq!(tree[0].conversation.len(), 4);

        engine.delete_conversation(conv.id).await.unwrap();
        assert_eq!(engine.conversation(conv.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        let left = tangent_store.load_by_conversation(conv.id).await.unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn deleted_conversation_handles_go_stale() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["ok"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();
        send(&engine, conv.id, "Hi").await.unwrap();

        let stale = engine.session(conv.id).await.unwrap();
        engine.delete_conversation(conv.id).await.unwrap();
        assert!(matches!(
            lock_open(conv.id, &stale).await,
            Err(TreeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fork_under_a_streaming_parent_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["ok"])));
        let engine = engine_with(&provider);
        let conv = engine.create_conversation(None).await.unwrap();
        let root = node_id(&send(&engine, conv.id, "Hi").await.unwrap());
        let child = node_id(&send(&engine, conv.id, "Drag?").await.unwrap());

        let held = engine
            .in_flight
            .acquire(conv.id, StreamTarget::Node(root))
            .unwrap();
        let err = engine
            .fork_from_node(conv.id, child, "Lift?".into(), None, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(provider.requests().len(), 2);
        assert_eq!(engine.active_path(conv.id).await.unwrap()[1].siblings.len(), 1);

        drop(held);
        engine
            .fork_from_node(conv.id, child, "Lift?".into(), None, |_| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(engine.active_path(conv.id).await.unwrap()[1].siblings.len(), 2);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_past_the_limit() {
        let provider = Arc::new(ScriptedProvider::new(Script::reply(&["ok"])));
        let mut config = TreeConfig::default();
        config.sessions.max_open = 1;
        let backends = TreeBackends::in_memory(Arc::clone(&provider) as Arc<dyn CompletionProvider>);
        let engine = TreeEngine::new(config, backends).unwrap();

        let first = engine.create_conversation(None).await.unwrap();
        send(&engine, first.id, "Hi").await.unwrap();
        let second = engine.create_conversation(None).await.unwrap();
        send(&engine, second.id, "Hello").await.unwrap();

        assert_eq!(engine.sessions.len(), 1);
        assert!(engine.sessions.contains_key(&second.id));

        let path = engine.active_path(first.id).await.unwrap();
        assert_eq!(path[0].node.assistant_response.as_deref(), Some("ok"));
        assert_eq!(engine.sessions.len(), 1);
    }
}
