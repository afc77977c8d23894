//! Map Data Events
//!
//! Serializable summaries of listener notifications. Listeners receive full
//! payloads; these records are what logging and recording adapters keep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo::BoundingBox;
use super::model::{EntityKey, MapDataWithGeometry};

/// A change notification, reduced to keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MapDataEvent {
    /// Entities were updated and/or deleted.
    Updated {
        updated: Vec<EntityKey>,
        geometries: usize,
        deleted: Vec<EntityKey>,
        timestamp: DateTime<Utc>,
    },

    /// A bounding box was replaced wholesale.
    ReplacedForBBox {
        bbox: BoundingBox,
        entities: Vec<EntityKey>,
        geometries: usize,
        timestamp: DateTime<Utc>,
    },

    /// Everything was cleared.
    Cleared { timestamp: DateTime<Utc> },
}

impl MapDataEvent {
    pub fn updated(updated: &MapDataWithGeometry, deleted: &[EntityKey]) -> Self {
        let mut keys: Vec<EntityKey> = updated.data.keys().copied().collect();
        keys.sort();
        let mut deleted = deleted.to_vec();
        deleted.sort();
        MapDataEvent::Updated {
            updated: keys,
            geometries: updated.geometries.len(),
            deleted,
            timestamp: Utc::now(),
        }
    }

    pub fn replaced_for_bbox(bbox: &BoundingBox, data: &MapDataWithGeometry) -> Self {
        let mut keys: Vec<EntityKey> = data.data.keys().copied().collect();
        keys.sort();
        MapDataEvent::ReplacedForBBox {
            bbox: *bbox,
            entities: keys,
            geometries: data.geometries.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn cleared() -> Self {
        MapDataEvent::Cleared {
            timestamp: Utc::now(),
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            MapDataEvent::Updated { .. } => "Updated",
            MapDataEvent::ReplacedForBBox { .. } => "ReplacedForBBox",
            MapDataEvent::Cleared { .. } => "Cleared",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MapDataEvent::Updated { timestamp, .. }
            | MapDataEvent::ReplacedForBBox { timestamp, .. }
            | MapDataEvent::Cleared { timestamp } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Entity, MapData, Node, Tags};
    use crate::domain::geo::LatLon;

    #[test]
    fn test_updated_event_sorts_keys() {
        let data = MapData::from_entities([
            Entity::Node(Node {
                id: 2,
                version: 1,
                tags: Tags::new(),
                position: LatLon::new(0.0, 0.0),
                timestamp_edited: 0,
            }),
            Entity::Node(Node {
                id: 1,
                version: 1,
                tags: Tags::new(),
                position: LatLon::new(0.0, 0.0),
                timestamp_edited: 0,
            }),
        ]);
        let payload = MapDataWithGeometry::new(data, []);
        let event = MapDataEvent::updated(&payload, &[EntityKey::way(9)]);

        match &event {
            MapDataEvent::Updated {
                updated, deleted, ..
            } => {
                assert_eq!(updated, &vec![EntityKey::node(1), EntityKey::node(2)]);
                assert_eq!(deleted, &vec![EntityKey::way(9)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(event.event_type(), "Updated");
    }

    #[test]
    fn test_event_serialization() {
        let event = MapDataEvent::cleared();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Cleared\""));
    }
}
