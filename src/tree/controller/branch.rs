//! Branch controller: node creation, forking and active-branch switching.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::tree::core::clock::MonotonicClock;
use crate::tree::core::config::BranchConfig;
use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::{ConversationId, NodeId};
use crate::tree::core::node::{BranchInfo, Node};
use crate::tree::navigator::{latest_leaf, path_to_root, siblings};
use crate::tree::storage::{NodeArena, NodeStore};

/// Which node the conversation view is positioned on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(tag = "state", content = "node_id", rename_all = "snake_case")]
pub enum ActiveNode {
    /// Conversation has no nodes yet.
    #[default]
    Empty,
    /// Positioned on this node.
    Active(NodeId),
}

impl ActiveNode {
    /// Active node id, if any.
    #[must_use]
    pub const fn node_id(self) -> Option<NodeId> {
        match self {
            Self::Empty => None,
            Self::Active(id) => Some(id),
        }
    }
}

/// Owns one conversation's node arena and its active node.
///
/// Writes go to the store first; the arena and the active node change only once the
/// store accepted the write.
pub struct BranchController {
    conversation_id: ConversationId,
    store: Arc<dyn NodeStore>,
    arena: NodeArena,
    active: ActiveNode,
    clock: MonotonicClock,
    config: BranchConfig,
}

impl BranchController {
    /// Controller for a conversation with no nodes.
    #[must_use]
    pub fn new(conversation_id: ConversationId, store: Arc<dyn NodeStore>, config: BranchConfig) -> Self {
        Self::from_nodes(conversation_id, store, config, Vec::new())
    }

    /// Controller over already loaded nodes; the latest leaf becomes active.
    #[must_use]
    pub fn from_nodes(
        conversation_id: ConversationId,
        store: Arc<dyn NodeStore>,
        config: BranchConfig,
        nodes: Vec<Node>,
    ) -> Self {
        let arena = NodeArena::from_nodes(nodes);
        let active = latest_leaf(&arena).map_or(ActiveNode::Empty, |node| ActiveNode::Active(node.id));
        let clock = MonotonicClock::starting_after(arena.latest_created_at());
        Self {
            conversation_id,
            store,
            arena,
            active,
            clock,
            config,
        }
    }

    /// Load a conversation's nodes from the store.
    ///
    /// # Errors
    /// Returns an error if the store read fails.
    pub async fn load(
        conversation_id: ConversationId,
        store: Arc<dyn NodeStore>,
        config: BranchConfig,
    ) -> TreeResult<Self> {
        let nodes = store.load_by_conversation(conversation_id).await?;
        debug!("Loaded {} nodes for conversation {conversation_id}", nodes.len());
        Ok(Self::from_nodes(conversation_id, store, config, nodes))
    }

    /// Owning conversation.
    #[must_use]
    pub const fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Current active state.
    #[must_use]
    pub const fn active(&self) -> ActiveNode {
        self.active
    }

    /// Active node, if any.
    #[must_use]
    pub fn active_node(&self) -> Option<&Node> {
        self.active.node_id().and_then(|id| self.arena.get(&id))
    }

    /// All nodes of the conversation.
    #[must_use]
    pub const fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.arena.get(id)
    }

    /// Create a node under `parent_id` (or a new root) and make it active.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown parent, or the store error if the insert
    /// fails. Neither the arena nor the active node change on error.
    pub async fn create_node(
        &mut self,
        user_message: String,
        parent_id: Option<NodeId>,
        branch_name: Option<String>,
    ) -> TreeResult<NodeId> {
        let depth = match parent_id {
            Some(parent) => {
                let Some(parent) = self.arena.get(&parent) else {
                    warn!(
                        "Ignoring node under unknown parent {parent} in conversation {}",
                        self.conversation_id
                    );
                    return Err(TreeError::not_found("node", parent));
                };
                parent.depth + 1
            }
            None => 0,
        };

        let node = Node {
            id: NodeId::new(),
            conversation_id: self.conversation_id,
            parent_id,
            user_message,
            assistant_response: None,
            branch_name,
            depth,
            created_at: self.clock.tick(),
        };
        let id = node.id;

        self.store.insert_node(node.clone()).await?;
        self.arena.insert(node);
        self.active = ActiveNode::Active(id);

        debug!("Created node {id} at depth {depth} in conversation {}", self.conversation_id);
        Ok(id)
    }

    /// Create a sibling of `node_id` and make it active.
    ///
    /// The fork shares the referenced node's parent, so forking a root produces
    /// another root. Without a `branch_name` the label is derived from the referenced
    /// node's message.
    ///
    /// # Errors
    /// Returns `NotFound` if `node_id` is unknown, or the store error if the insert
    /// fails.
    pub async fn fork_from_node(
        &mut self,
        node_id: NodeId,
        user_message: String,
        branch_name: Option<String>,
    ) -> TreeResult<NodeId> {
        let Some(origin) = self.arena.get(&node_id) else {
            warn!("Fork requested from unknown node {node_id}");
            return Err(TreeError::not_found("node", node_id));
        };
        let parent_id = origin.parent_id;
        let branch_name = branch_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                let head: String = origin
                    .user_message
                    .chars()
                    .take(self.config.fork_label_chars)
                    .collect();
                format!("Branch from {head}...")
            });

        let id = self.create_node(user_message, parent_id, Some(branch_name)).await?;
        info!("Forked node {id} as sibling of {node_id}");
        Ok(id)
    }

    /// Make `node_id` active. Unknown ids leave the state unchanged.
    ///
    /// Returns whether the active node changed.
    pub fn switch_to_branch(&mut self, node_id: NodeId) -> bool {
        if !self.arena.contains(&node_id) {
            warn!(
                "Ignoring switch to unknown node {node_id} in conversation {}",
                self.conversation_id
            );
            return false;
        }
        let changed = self.active != ActiveNode::Active(node_id);
        self.active = ActiveNode::Active(node_id);
        changed
    }

    /// Set a node's assistant response. Repeated calls overwrite the previous text.
    ///
    /// # Errors
    /// Returns `NotFound` if the node is unknown, or the store error if the update
    /// fails.
    pub async fn update_node_response(&mut self, node_id: NodeId, text: String) -> TreeResult<()> {
        if !self.arena.contains(&node_id) {
            warn!(
                "Dropping response for unknown node {node_id} in conversation {}",
                self.conversation_id
            );
            return Err(TreeError::not_found("node", node_id));
        }
        self.store.update_response(node_id, text.clone()).await?;
        if let Some(node) = self.arena.get_mut(&node_id) {
            node.assistant_response = Some(text);
        }
        Ok(())
    }

    /// Root-first path to the active node.
    #[must_use]
    pub fn active_path(&self) -> Vec<&Node> {
        self.active
            .node_id()
            .map(|id| path_to_root(&self.arena, &id))
            .unwrap_or_default()
    }

    /// Siblings of `node_id`, itself included, oldest first.
    #[must_use]
    pub fn siblings(&self, node_id: &NodeId) -> Vec<BranchInfo> {
        siblings(&self.arena, node_id, self.config.preview_chars)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use super::*;
    use crate::tree::storage::{MemoryStore, StoreFuture};

    /// Log sink shared with a test-local subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    fn controller() -> (BranchController, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let controller = BranchController::new(
            ConversationId::new(),
            Arc::clone(&store) as Arc<dyn NodeStore>,
            BranchConfig::default(),
        );
        (controller, store)
    }

    struct FailingStore;

    impl NodeStore for FailingStore {
        fn insert_node(&self, _node: Node) -> StoreFuture<'_, TreeResult<()>> {
            Box::pin(async { Err(TreeError::Persistence("disk full".to_string())) })
        }

        fn update_response(&self, _id: NodeId, _response: String) -> StoreFuture<'_, TreeResult<()>> {
            Box::pin(async { Err(TreeError::Persistence("disk full".to_string())) })
        }

        fn load_by_conversation(
            &self,
            _conversation_id: ConversationId,
        ) -> StoreFuture<'_, TreeResult<Vec<Node>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn delete_by_conversation(
            &self,
            _conversation_id: ConversationId,
        ) -> StoreFuture<'_, TreeResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn create_node_sets_depth_and_active() {
        let (mut c, _) = controller();
        assert_eq!(c.active(), ActiveNode::Empty);

        let root = c.create_node("Hi".to_string(), None, None).await.unwrap();
        let child = c.create_node("More".to_string(), Some(root), None).await.unwrap();

        assert_eq!(c.node(&root).unwrap().depth, 0);
        assert_eq!(c.node(&child).unwrap().depth, 1);
        assert_eq!(c.active(), ActiveNode::Active(child));
        let path: Vec<NodeId> = c.active_path().iter().map(|n| n.id).collect();
        assert_eq!(path, vec![root, child]);
    }

    #[tokio::test]
    async fn failed_insert_leaves_state_unchanged() {
        let mut c = BranchController::new(
            ConversationId::new(),
            Arc::new(FailingStore),
            BranchConfig::default(),
        );
        let err = c.create_node("Hi".to_string(), None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::tree::core::errors::ErrorKind::Persistence);
        assert_eq!(c.active(), ActiveNode::Empty);
        assert!(c.arena().is_empty());
    }

    #[tokio::test]
    async fn unknown_parent_is_not_found() {
        let (mut c, _) = controller();
        let err = c
            .create_node("Hi".to_string(), Some(NodeId::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::NotFound { .. }));
        assert!(c.arena().is_empty());
    }

    #[tokio::test]
    async fn not_found_recoveries_are_logged_at_warn() {
        let (logs, _guard) = capture_logs();
        let (mut c, _) = controller();
        let ghost = NodeId::new();

        assert!(c.create_node("Hi".to_string(), Some(ghost), None).await.is_err());
        assert!(c.update_node_response(ghost, "late".to_string()).await.is_err());

        let text = logs.text();
        assert!(text.contains("WARN"));
        assert!(text.contains(&format!("unknown parent {ghost}")));
        assert!(text.contains(&format!("unknown node {ghost}")));
    }

    #[tokio::test]
    async fn fork_from_root_creates_second_root() {
        let (mut c, _) = controller();
        let root = c.create_node("Hi".to_string(), None, None).await.unwrap();
        c.update_node_response(root, "Hello".to_string()).await.unwrap();

        let fork = c
            .fork_from_node(root, "Tell me about X".to_string(), Some("X-exploration".to_string()))
            .await
            .unwrap();

        let fork_node = c.node(&fork).unwrap();
        assert_eq!(fork_node.parent_id, None);
        assert_ne!(fork_node.parent_id, Some(root));
        assert_eq!(fork_node.depth, 0);

        let sibs = c.siblings(&root);
        assert_eq!(sibs.len(), 2);
        assert_eq!(sibs[0].id, root);
        assert_eq!(sibs[1].id, fork);
        assert_eq!(sibs[1].branch_name.as_deref(), Some("X-exploration"));

        let path: Vec<NodeId> = path_to_root(c.arena(), &fork).iter().map(|n| n.id).collect();
        assert_eq!(path, vec![fork]);
    }

    #[tokio::test]
    async fn fork_of_nested_node_shares_its_parent_and_gets_default_label() {
        let (mut c, _) = controller();
        let root = c.create_node("Hi".to_string(), None, None).await.unwrap();
        let child = c
            .create_node("Explain the drag equation please".to_string(), Some(root), None)
            .await
            .unwrap();

        let fork = c.fork_from_node(child, "Alternative".to_string(), None).await.unwrap();
        let fork_node = c.node(&fork).unwrap();
        assert_eq!(fork_node.parent_id, Some(root));
        assert_eq!(fork_node.depth, 1);
        assert_eq!(
            fork_node.branch_name.as_deref(),
            Some("Branch from Explain the drag equ...")
        );
        assert_eq!(c.active(), ActiveNode::Active(fork));
    }

    #[tokio::test]
    async fn switch_to_unknown_node_is_noop() {
        let (mut c, _) = controller();
        let root = c.create_node("Hi".to_string(), None, None).await.unwrap();
        let other = c.fork_from_node(root, "Other".to_string(), None).await.unwrap();

        assert!(c.switch_to_branch(root));
        assert_eq!(c.active(), ActiveNode::Active(root));
        assert!(!c.switch_to_branch(NodeId::new()));
        assert_eq!(c.active(), ActiveNode::Active(root));
        assert!(c.switch_to_branch(other));
    }

    #[tokio::test]
    async fn update_response_is_idempotent() {
        let (mut c, store) = controller();
        let root = c.create_node("Hi".to_string(), None, None).await.unwrap();

        c.update_node_response(root, "partial".to_string()).await.unwrap();
        c.update_node_response(root, "partial+more".to_string()).await.unwrap();

        assert_eq!(c.arena().len(), 1);
        assert_eq!(c.node(&root).unwrap().assistant_response.as_deref(), Some("partial+more"));

        let stored = NodeStore::load_by_conversation(store.as_ref(), c.conversation_id())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].assistant_response.as_deref(), Some("partial+more"));
    }

    #[tokio::test]
    async fn load_activates_latest_leaf() {
        let (mut c, store) = controller();
        let root = c.create_node("Hi".to_string(), None, None).await.unwrap();
        let a = c.create_node("A".to_string(), Some(root), None).await.unwrap();
        let b = c.fork_from_node(a, "B".to_string(), None).await.unwrap();
        c.switch_to_branch(root);

        let reloaded = BranchController::load(
            c.conversation_id(),
            store as Arc<dyn NodeStore>,
            BranchConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.active(), ActiveNode::Active(b));
        assert_eq!(reloaded.arena().len(), 3);
    }
}
