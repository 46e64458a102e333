//! Pin set: entities excluded from flush.

use crate::config::PinCascade;
use crate::entity::EntityCache;
use crate::error::{CoreError, CoreResult};
use dstate_protocol::Key;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Set of keys currently excluded from flush.
#[derive(Debug, Default)]
pub struct PinSet {
    pinned: BTreeSet<Key>,
}

impl PinSet {
    /// Creates an empty pin set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `key`. Returns false if it was already pinned.
    pub fn pin(&mut self, key: Key) -> bool {
        self.pinned.insert(key)
    }

    /// Releases a pin.
    ///
    /// # Errors
    ///
    /// Fails if `key` is not pinned.
    pub fn unpin(&mut self, key: &Key) -> CoreResult<()> {
        if self.pinned.remove(key) {
            Ok(())
        } else {
            Err(CoreError::invalid_state(format!("{key} is not pinned")))
        }
    }

    /// Returns true if `key` is pinned.
    pub fn contains(&self, key: &Key) -> bool {
        self.pinned.contains(key)
    }

    /// Returns the number of pins.
    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    /// Returns true if nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }

    /// Iterates pinned keys.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.pinned.iter()
    }

    /// Computes the keys whose operations must not be flushed.
    ///
    /// `pending` holds the keys created in this cycle and not yet flushed.
    /// Pinned keys are always excluded. Pending entities reachable from a
    /// pinned one through loaded references are excluded too: all of them
    /// under [`PinCascade::Transitive`], and under
    /// [`PinCascade::Exclusive`] only those that no live entity outside the
    /// excluded set references.
    pub fn excluded_keys(
        &self,
        cache: &EntityCache,
        pending: &BTreeSet<Key>,
        cascade: PinCascade,
    ) -> BTreeSet<Key> {
        let mut reached = BTreeSet::new();
        let mut stack: Vec<Key> = self.pinned.iter().cloned().collect();
        while let Some(key) = stack.pop() {
            let Some(state) = cache.get(&key) else {
                continue;
            };
            for (_, target) in state.references() {
                if pending.contains(target)
                    && !self.pinned.contains(target)
                    && reached.insert(target.clone())
                {
                    stack.push(target.clone());
                }
            }
        }

        if cascade == PinCascade::Exclusive {
            loop {
                let shared: Vec<Key> = {
                    let excluded: BTreeSet<&Key> =
                        self.pinned.iter().chain(reached.iter()).collect();
                    reached
                        .iter()
                        .filter(|candidate| {
                            cache
                                .referencers(candidate)
                                .iter()
                                .any(|(by, _)| !excluded.contains(by))
                        })
                        .cloned()
                        .collect()
                };
                if shared.is_empty() {
                    break;
                }
                for key in shared {
                    reached.remove(&key);
                }
            }
        }

        self.pinned.iter().cloned().chain(reached).collect()
    }
}

/// Scoped pin returned by [`DisconnectedState::pin`].
///
/// Dropping the guard releases the pin; [`PinGuard::release`] does the
/// same and reports errors.
///
/// [`DisconnectedState::pin`]: crate::DisconnectedState::pin
#[derive(Debug)]
#[must_use = "the pin is released when the guard is dropped"]
pub struct PinGuard {
    pins: Arc<Mutex<PinSet>>,
    key: Key,
    released: bool,
}

impl PinGuard {
    pub(crate) fn new(pins: Arc<Mutex<PinSet>>, key: Key) -> Self {
        Self {
            pins,
            key,
            released: false,
        }
    }

    /// Returns the pinned key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Releases the pin.
    ///
    /// # Errors
    ///
    /// Fails if the pin was already released through another path.
    pub fn release(mut self) -> CoreResult<()> {
        self.released = true;
        self.pins.lock().unpin(&self.key)
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.pins.lock().unpin(&self.key) {
            tracing::warn!(key = %self.key, error = %e, "pin released twice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use dstate_protocol::{FieldValue, TypeTag, VersionInfo};

    fn temp(n: i64) -> Key {
        Key::temporary(TypeTag::new(1), vec![FieldValue::Integer(n)])
    }

    fn node(key: Key, next: Option<Key>) -> EntityState {
        EntityState::synchronized(key, vec![Some(next.into())], VersionInfo::Void)
    }

    // 1 -> 2 -> 3, and 4 -> 3
    fn chain() -> (EntityCache, BTreeSet<Key>) {
        let mut cache = EntityCache::new();
        cache.insert(node(temp(1), Some(temp(2))));
        cache.insert(node(temp(2), Some(temp(3))));
        cache.insert(node(temp(3), None));
        cache.insert(node(temp(4), Some(temp(3))));
        let pending = (1..=4).map(temp).collect();
        (cache, pending)
    }

    #[test]
    fn pin_is_idempotent() {
        let mut pins = PinSet::new();
        assert!(pins.pin(temp(1)));
        assert!(!pins.pin(temp(1)));
        pins.unpin(&temp(1)).unwrap();
        assert!(pins.unpin(&temp(1)).is_err());
    }

    #[test]
    fn transitive_excludes_everything_reachable() {
        let (cache, pending) = chain();
        let mut pins = PinSet::new();
        pins.pin(temp(1));
        assert_eq!(
            pins.excluded_keys(&cache, &pending, PinCascade::Transitive),
            BTreeSet::from([temp(1), temp(2), temp(3)])
        );
    }

    #[test]
    fn exclusive_keeps_shared_dependents_flushable() {
        let (cache, pending) = chain();
        let mut pins = PinSet::new();
        pins.pin(temp(1));
        assert_eq!(
            pins.excluded_keys(&cache, &pending, PinCascade::Exclusive),
            BTreeSet::from([temp(1), temp(2)])
        );
    }

    #[test]
    fn non_pending_targets_are_not_excluded() {
        let (cache, _) = chain();
        let pending = BTreeSet::from([temp(1)]);
        let mut pins = PinSet::new();
        pins.pin(temp(1));
        assert_eq!(
            pins.excluded_keys(&cache, &pending, PinCascade::Transitive),
            BTreeSet::from([temp(1)])
        );
    }

    #[test]
    fn guard_releases_on_drop() {
        let pins = Arc::new(Mutex::new(PinSet::new()));
        pins.lock().pin(temp(1));
        let guard = PinGuard::new(Arc::clone(&pins), temp(1));
        assert_eq!(guard.key(), &temp(1));
        drop(guard);
        assert!(pins.lock().is_empty());

        pins.lock().pin(temp(2));
        PinGuard::new(Arc::clone(&pins), temp(2)).release().unwrap();
        assert!(pins.lock().is_empty());
    }
}
