//! Durable state: the versioned context store and checkpoint files.

pub mod checkpoint;
pub mod context;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use context::{ContextStore, DecisionRecord, PendingPublish};
