//! Map Data Listener Adapters
//!
//! Implements the `MapDataListener` port with logging and recording
//! backends.

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::{BoundingBox, EntityKey, MapDataEvent, MapDataListener, MapDataWithGeometry};

/// Logs every notification.
#[derive(Debug, Clone, Default)]
pub struct LoggingListener {
    /// Whether to log at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    fn log(&self, event: &MapDataEvent) {
        let event_type = event.event_type();
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        if self.info_level {
            info!(event_type = %event_type, event = %json, "Map data changed");
        } else {
            debug!(event_type = %event_type, event = %json, "Map data changed");
        }
    }
}

impl MapDataListener for LoggingListener {
    fn on_updated(&self, updated: &MapDataWithGeometry, deleted: &[EntityKey]) {
        self.log(&MapDataEvent::updated(updated, deleted));
    }

    fn on_replaced_for_bbox(&self, bbox: &BoundingBox, data: &MapDataWithGeometry) {
        self.log(&MapDataEvent::replaced_for_bbox(bbox, data));
    }

    fn on_cleared(&self) {
        self.log(&MapDataEvent::cleared());
    }
}

/// Keeps every notification for later inspection.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: RwLock<Vec<MapDataEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MapDataEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<MapDataEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

impl MapDataListener for RecordingListener {
    fn on_updated(&self, updated: &MapDataWithGeometry, deleted: &[EntityKey]) {
        self.events
            .write()
            .push(MapDataEvent::updated(updated, deleted));
    }

    fn on_replaced_for_bbox(&self, bbox: &BoundingBox, data: &MapDataWithGeometry) {
        self.events
            .write()
            .push(MapDataEvent::replaced_for_bbox(bbox, data));
    }

    fn on_cleared(&self) {
        self.events.write().push(MapDataEvent::cleared());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MapData;

    #[test]
    fn test_logging_listener() {
        let listener = LoggingListener::new();
        // Should not panic
        listener.on_cleared();
        listener.on_updated(&MapDataWithGeometry::default(), &[EntityKey::node(1)]);
    }

    #[test]
    fn test_recording_listener() {
        let listener = RecordingListener::new();
        assert!(listener.is_empty());

        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        listener.on_replaced_for_bbox(&bbox, &MapDataWithGeometry::new(MapData::new(), []));
        listener.on_cleared();

        assert_eq!(listener.len(), 2);
        assert_eq!(listener.events_of_type("Cleared").len(), 1);

        listener.clear();
        assert!(listener.is_empty());
    }
}
