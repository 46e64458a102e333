//! Disconnected state configuration.

use serde::{Deserialize, Serialize};

/// Which New entities are deferred together with a pinned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinCascade {
    /// Only New entities reachable from the pinned one and from nothing
    /// outside the excluded set.
    #[default]
    Exclusive,
    /// Every New entity reachable from the pinned one.
    Transitive,
}

/// How fetched store data merges into an entity that is already cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeMode {
    /// Refresh unmodified entries; fill unavailable fields of modified ones.
    #[default]
    PreferNew,
    /// Only fill unavailable fields.
    PreferOriginal,
}

/// Configuration for a [`DisconnectedState`](crate::DisconnectedState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pin cascade rule used when flushing with outstanding pins.
    pub pin_cascade: PinCascade,

    /// Merge rule for prefetched data.
    pub merge_mode: MergeMode,

    /// Whether a connected removal also asks the store for referencers.
    pub fetch_references_on_remove: bool,

    /// Maximum nesting of cascading removals.
    pub max_cascade_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pin_cascade: PinCascade::Exclusive,
            merge_mode: MergeMode::PreferNew,
            fetch_references_on_remove: true,
            max_cascade_depth: 64,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pin cascade rule.
    #[must_use]
    pub const fn pin_cascade(mut self, value: PinCascade) -> Self {
        self.pin_cascade = value;
        self
    }

    /// Sets the merge rule.
    #[must_use]
    pub const fn merge_mode(mut self, value: MergeMode) -> Self {
        self.merge_mode = value;
        self
    }

    /// Sets whether connected removals query the store for referencers.
    #[must_use]
    pub const fn fetch_references_on_remove(mut self, value: bool) -> Self {
        self.fetch_references_on_remove = value;
        self
    }

    /// Sets the maximum cascade depth.
    #[must_use]
    pub const fn max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }
}
