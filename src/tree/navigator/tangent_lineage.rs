//! Lineage of a tangent inside its anchor message's tangent forest.

use crate::tree::core::ids::TangentId;
use crate::tree::core::tangent::TangentRecord;
use crate::tree::storage::tangent_forest::TangentForest;

/// Look a tangent up at any nesting depth.
#[must_use]
pub fn find_tangent<'a>(forest: &'a TangentForest, id: &TangentId) -> Option<&'a TangentRecord> {
    forest.get(id)
}

/// Tangents from the top-level ancestor down to `id`, target last.
///
/// Empty when `id` is not part of the forest.
#[must_use]
pub fn lineage<'a>(forest: &'a TangentForest, id: &TangentId) -> Vec<&'a TangentRecord> {
    let mut chain = Vec::new();
    let mut current = forest.get(id);

    while let Some(record) = current {
        chain.push(record);
        if chain.len() > forest.len() {
            chain.clear();
            break;
        }
        current = record.parent_id.as_ref().and_then(|parent| forest.get(parent));
    }

    chain.reverse();
    chain
}
