//! Created Elements Tracker and Persistence Signal Adapters

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::domain::{CreatedElementsTracker, EntityKey, PersistenceSignal};

/// Remembers keys of locally created entities.
#[derive(Debug, Default)]
pub struct InMemoryCreatedElementsTracker {
    keys: RwLock<BTreeSet<EntityKey>>,
}

impl InMemoryCreatedElementsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.keys.read().contains(key)
    }

    /// Tracked keys in order.
    pub fn keys(&self) -> Vec<EntityKey> {
        self.keys.read().iter().copied().collect()
    }
}

impl CreatedElementsTracker for InMemoryCreatedElementsTracker {
    fn track_created(&self, keys: &[EntityKey]) {
        self.keys.write().extend(keys.iter().copied());
    }

    fn untrack(&self, keys: &[EntityKey]) {
        let mut tracked = self.keys.write();
        for key in keys {
            tracked.remove(key);
        }
    }

    fn clear(&self) {
        self.keys.write().clear();
    }
}

/// Persistence signal backed by a flag, with the history of transitions.
#[derive(Debug, Default)]
pub struct FlagPersistenceSignal {
    persisting: AtomicBool,
    history: Mutex<Vec<bool>>,
}

impl FlagPersistenceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_persisting(&self) -> bool {
        self.persisting.load(Ordering::SeqCst)
    }

    pub fn transitions(&self) -> Vec<bool> {
        self.history.lock().clone()
    }
}

impl PersistenceSignal for FlagPersistenceSignal {
    fn set_persisting(&self, persisting: bool) {
        self.persisting.store(persisting, Ordering::SeqCst);
        self.history.lock().push(persisting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_untrack() {
        let tracker = InMemoryCreatedElementsTracker::new();
        tracker.track_created(&[EntityKey::node(1), EntityKey::way(2)]);
        tracker.untrack(&[EntityKey::node(1)]);

        assert!(!tracker.contains(&EntityKey::node(1)));
        assert_eq!(tracker.keys(), vec![EntityKey::way(2)]);

        tracker.clear();
        assert!(tracker.keys().is_empty());
    }

    #[test]
    fn test_flag_signal_history() {
        let signal = FlagPersistenceSignal::new();
        signal.set_persisting(true);
        signal.set_persisting(false);
        assert!(!signal.is_persisting());
        assert_eq!(signal.transitions(), vec![true, false]);
    }
}
