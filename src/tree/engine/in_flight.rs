//! Registry of targets that currently have a reply streaming.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::warn;

use crate::tree::core::errors::{TreeError, TreeResult};
use crate::tree::core::ids::ConversationId;
use crate::tree::stream::StreamTarget;

/// Shared set of busy stream targets, each tagged with its conversation.
#[derive(Clone, Debug, Default)]
pub struct InFlightRegistry {
    targets: Arc<DashMap<StreamTarget, ConversationId>>,
}

impl InFlightRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` for the lifetime of the returned guard.
    ///
    /// # Errors
    /// Returns `StreamInProgress` if another stream holds the target.
    pub fn acquire(
        &self,
        conversation_id: ConversationId,
        target: StreamTarget,
    ) -> TreeResult<InFlightGuard> {
        match self.targets.entry(target) {
            Entry::Occupied(_) => {
                warn!("Rejecting second stream for {target}");
                return Err(TreeError::StreamInProgress(target.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(conversation_id);
            }
        }
        Ok(InFlightGuard {
            targets: Arc::clone(&self.targets),
            target,
        })
    }

    /// Whether `target` is busy.
    #[must_use]
    pub fn contains(&self, target: &StreamTarget) -> bool {
        self.targets.contains_key(target)
    }

    /// Any target of `conversation_id` that is still streaming.
    #[must_use]
    pub fn busy_in(&self, conversation_id: ConversationId) -> Option<StreamTarget> {
        self.targets
            .iter()
            .find(|entry| *entry.value() == conversation_id)
            .map(|entry| *entry.key())
    }

    /// Number of busy targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether nothing is streaming.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Releases its target on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    targets: Arc<DashMap<StreamTarget, ConversationId>>,
    target: StreamTarget,
}

impl InFlightGuard {
    /// The claimed target.
    #[must_use]
    pub const fn target(&self) -> StreamTarget {
        self.target
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.targets.remove(&self.target);
    }
}
