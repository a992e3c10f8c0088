//! Engine orchestration modules.

pub mod core;
pub mod in_flight;

pub use self::core::{ConversationSession, ConversationView, PathEntry, TreeBackends, TreeEngine};
pub use in_flight::{InFlightGuard, InFlightRegistry};
