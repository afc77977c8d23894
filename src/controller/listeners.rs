//! Listener Registry
//!
//! Thread-safe list of `MapDataListener`s. Notification runs on the calling
//! thread against a snapshot, so listeners may (un)register from inside a
//! callback.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::{BoundingBox, EntityKey, MapDataListener, MapDataWithGeometry};

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn MapDataListener>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listener_count", &self.len())
            .finish()
    }
}

fn same_listener(a: &Arc<dyn MapDataListener>, b: &Arc<dyn MapDataListener>) -> bool {
    // compare data pointers only; vtable pointers may differ per codegen unit
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn MapDataListener>) {
        self.listeners.write().push(listener);
    }

    /// Returns whether the listener was registered.
    pub fn remove(&self, listener: &Arc<dyn MapDataListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn MapDataListener>> {
        self.listeners.read().clone()
    }

    /// Not delivered when there is nothing updated and nothing deleted.
    pub fn notify_updated(&self, updated: &MapDataWithGeometry, deleted: &[EntityKey]) {
        if updated.is_empty() && deleted.is_empty() {
            return;
        }
        for listener in self.snapshot() {
            listener.on_updated(updated, deleted);
        }
    }

    pub fn notify_replaced_for_bbox(&self, bbox: &BoundingBox, data: &MapDataWithGeometry) {
        for listener in self.snapshot() {
            listener.on_replaced_for_bbox(bbox, data);
        }
    }

    pub fn notify_cleared(&self) {
        for listener in self.snapshot() {
            listener.on_cleared();
        }
    }
}
