//! Replay of operation logs against a backing session.

mod engine;
mod state;

pub use engine::SyncEngine;
pub use state::{SyncState, SyncStats};
