//! Checkpointed operation log.

use crate::codec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::key::Key;
use crate::mapping::KeyMapping;
use crate::operation::Operation;
use crate::version::VersionInfo;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Handle to a checkpoint mark in an [`OperationLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointId(u64);

impl CheckpointId {
    /// Returns the raw checkpoint number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    id: CheckpointId,
    position: usize,
}

/// Ordered, append-only log of mutations captured during one cycle.
///
/// The log maintains:
/// - Operations in the order they were accepted
/// - One checkpoint mark per open nested transaction scope
/// - The version each pre-existing entity had when the log first touched it
///
/// # Invariants
///
/// - Operations are never modified in place once appended
/// - Checkpoints are released or rolled back innermost first
/// - The first recorded base version of a key wins
#[derive(Debug, Clone)]
pub struct OperationLog {
    cycle_id: Uuid,
    entries: Vec<Operation>,
    marks: Vec<Mark>,
    next_checkpoint: u64,
    base_versions: BTreeMap<Key, VersionInfo>,
}

impl OperationLog {
    /// Creates an empty log for a new cycle.
    pub fn new() -> Self {
        Self::with_cycle_id(Uuid::new_v4())
    }

    /// Creates an empty log with a known cycle id.
    pub fn with_cycle_id(cycle_id: Uuid) -> Self {
        Self {
            cycle_id,
            entries: Vec::new(),
            marks: Vec::new(),
            next_checkpoint: 1,
            base_versions: BTreeMap::new(),
        }
    }

    /// Rebuilds a log from decoded parts.
    pub fn from_parts(
        cycle_id: Uuid,
        base_versions: BTreeMap<Key, VersionInfo>,
        entries: Vec<Operation>,
    ) -> Self {
        Self {
            cycle_id,
            entries,
            marks: Vec::new(),
            next_checkpoint: 1,
            base_versions,
        }
    }

    /// Returns the id of the cycle that produced this log.
    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    /// Appends an operation and returns its position.
    pub fn append(&mut self, operation: Operation) -> usize {
        self.entries.push(operation);
        self.entries.len() - 1
    }

    /// Returns the operations in log order.
    pub fn operations(&self) -> &[Operation] {
        &self.entries
    }

    /// Returns the number of operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the log holds no operations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opens a checkpoint at the current end of the log.
    pub fn checkpoint(&mut self) -> CheckpointId {
        let id = CheckpointId(self.next_checkpoint);
        self.next_checkpoint += 1;
        self.marks.push(Mark {
            id,
            position: self.entries.len(),
        });
        id
    }

    /// Returns the number of open checkpoints.
    pub fn open_checkpoints(&self) -> usize {
        self.marks.len()
    }

    /// Returns the log position a checkpoint was taken at.
    pub fn checkpoint_position(&self, id: CheckpointId) -> Option<usize> {
        self.marks.iter().find(|m| m.id == id).map(|m| m.position)
    }

    /// Drops every operation appended after `id`, along with `id` and any
    /// checkpoint nested inside it. Base versions of keys no remaining
    /// operation mutates are dropped too.
    ///
    /// Returns the removed operations in log order.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not open.
    pub fn rollback_to(&mut self, id: CheckpointId) -> ProtocolResult<Vec<Operation>> {
        let index = self
            .marks
            .iter()
            .position(|m| m.id == id)
            .ok_or(ProtocolError::UnknownCheckpoint(id.0))?;
        let position = self.marks[index].position;
        self.marks.truncate(index);
        let removed = self.entries.split_off(position.min(self.entries.len()));
        self.prune_base_versions();
        Ok(removed)
    }

    /// Closes `id`, keeping everything appended since it was opened.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not open or is not the innermost checkpoint.
    pub fn release(&mut self, id: CheckpointId) -> ProtocolResult<()> {
        match self.marks.last() {
            Some(last) if last.id == id => {
                self.marks.pop();
                Ok(())
            }
            Some(last) if self.marks.iter().any(|m| m.id == id) => {
                Err(ProtocolError::CheckpointOrder {
                    requested: id.0,
                    innermost: last.id.0,
                })
            }
            _ => Err(ProtocolError::UnknownCheckpoint(id.0)),
        }
    }

    /// Records the version `key` had before this log first touched it.
    ///
    /// Returns false if a base version was already recorded.
    pub fn record_base_version(&mut self, key: Key, version: VersionInfo) -> bool {
        if self.base_versions.contains_key(&key) {
            return false;
        }
        self.base_versions.insert(key, version);
        true
    }

    /// Overwrites the base version of `key` if one is recorded.
    ///
    /// Used when the caller rebases pending changes onto a newer store
    /// version after a conflict. Returns false if none was recorded.
    pub fn refresh_base_version(&mut self, key: &Key, version: VersionInfo) -> bool {
        match self.base_versions.get_mut(key) {
            Some(base) => {
                *base = version;
                true
            }
            None => false,
        }
    }

    /// Returns the recorded base version of `key`.
    pub fn base_version(&self, key: &Key) -> Option<&VersionInfo> {
        self.base_versions.get(key)
    }

    /// Returns every recorded base version.
    pub fn base_versions(&self) -> &BTreeMap<Key, VersionInfo> {
        &self.base_versions
    }

    /// Returns the keys created by this log.
    pub fn created_keys(&self) -> BTreeSet<&Key> {
        self.entries
            .iter()
            .filter_map(|op| match op {
                Operation::CreateEntity { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Returns the keys mutated by this log.
    pub fn subject_keys(&self) -> BTreeSet<&Key> {
        self.entries.iter().map(Operation::key).collect()
    }

    /// Removes the operations at the given positions, keeping the rest in
    /// order.
    ///
    /// Checkpoint positions shift down accordingly and base versions of
    /// keys no remaining operation mutates are dropped.
    pub fn remove_positions(&mut self, positions: &BTreeSet<usize>) {
        if positions.is_empty() {
            return;
        }
        let kept_before = |position: usize| {
            position - positions.range(..position).count()
        };
        for mark in &mut self.marks {
            mark.position = kept_before(mark.position.min(self.entries.len()));
        }
        let entries = std::mem::take(&mut self.entries);
        self.entries = entries
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !positions.contains(i))
            .map(|(_, op)| op)
            .collect();
        self.prune_base_versions();
    }

    fn prune_base_versions(&mut self) {
        let remaining: BTreeSet<Key> = self.subject_keys().into_iter().cloned().collect();
        self.base_versions.retain(|key, _| remaining.contains(key));
    }

    /// Rewrites every key in the log through `mapping`.
    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        for op in &mut self.entries {
            op.map_keys(&mut |key| mapping.get(key).cloned());
        }
    }

    /// Serializes the log into the portable binary format.
    ///
    /// # Errors
    ///
    /// Fails if checkpoints are still open or a record cannot be encoded.
    pub fn serialize(&self) -> ProtocolResult<Vec<u8>> {
        codec::encode_log(self)
    }

    /// Reconstructs a log from [`OperationLog::serialize`] output.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not a valid, intact log.
    pub fn deserialize(bytes: &[u8]) -> ProtocolResult<Self> {
        codec::decode_log(bytes)
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}
