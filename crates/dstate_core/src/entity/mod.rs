//! Entity states and the entity state cache.

mod cache;
mod state;

pub use cache::EntityCache;
pub use state::{EntityState, PersistenceState};
