//! Controllers that mutate the node arena and tangent forests.

pub mod branch;
pub mod tangent;

pub use branch::{ActiveNode, BranchController};
pub use tangent::TangentController;
