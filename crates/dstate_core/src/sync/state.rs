//! Replay state machine and statistics.

use std::fmt;

/// State of the synchronization engine.
///
/// ```text
/// Idle -> Validating -> Applying -> Committed
///            |              |
///            v              v
///        Rejected         Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No replay has run yet.
    #[default]
    Idle,
    /// Comparing captured versions with the store.
    Validating,
    /// Replaying operations inside the store transaction.
    Applying,
    /// The last replay committed.
    Committed,
    /// The last replay was rejected for a version conflict.
    Rejected,
    /// The last replay failed and was rolled back.
    Failed,
}

impl SyncState {
    /// Returns true while a replay is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Validating | SyncState::Applying)
    }

    /// Returns true if a new replay may start.
    pub fn can_start(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Validating => "validating",
            SyncState::Applying => "applying",
            SyncState::Committed => "committed",
            SyncState::Rejected => "rejected",
            SyncState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Statistics about replays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Replays that committed.
    pub replays_committed: u64,
    /// Replays rejected for version conflicts.
    pub replays_rejected: u64,
    /// Replays that failed while applying.
    pub replays_failed: u64,
    /// Operations applied by committed replays.
    pub operations_applied: u64,
    /// Temporary keys replaced by committed replays.
    pub keys_remapped: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(SyncState::Validating.is_active());
        assert!(SyncState::Applying.is_active());
        assert!(SyncState::Failed.can_start());
        assert!(SyncState::Committed.can_start());
        assert_eq!(SyncState::default(), SyncState::Idle);
        assert_eq!(SyncState::Rejected.to_string(), "rejected");
    }
}
