//! Pure read-only traversals over the node arena and tangent forests.

pub mod path;
pub mod siblings;
pub mod tangent_lineage;

pub use path::{PathHints, is_ancestor, path_hints, path_to_root};
pub use siblings::{children, latest_leaf, siblings};
pub use tangent_lineage::{find_tangent, lineage};
