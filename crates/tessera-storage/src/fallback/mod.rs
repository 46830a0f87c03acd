//! Local fallback storage
//!
//! Rotating, append-only JSONL files that hold records the primary sink
//! could not accept, until [`FallbackStore::recover`] replays them.

mod pruning;
mod store;

pub use pruning::files_to_prune;
pub use store::{FallbackConfig, FallbackEntry, FallbackStore, RecoveryReport};
