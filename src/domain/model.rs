//! Map Data Model
//!
//! Entities (nodes, ways, relations), their identity keys, and the batch
//! types that flow between storage, cache, controller and listeners.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::geo::{BoundingBox, Geometry, LatLon};

/// Ordered set of string tags.
pub type Tags = BTreeMap<String, String>;

/// Kind of a map entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Node,
    Way,
    Relation,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Way => write!(f, "way"),
            EntityKind::Relation => write!(f, "relation"),
        }
    }
}

/// Identity of an entity, unique within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn node(id: i64) -> Self {
        Self::new(EntityKind::Node, id)
    }

    pub fn way(id: i64) -> Self {
        Self::new(EntityKind::Way, id)
    }

    pub fn relation(id: i64) -> Self {
        Self::new(EntityKind::Relation, id)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub version: i32,
    #[serde(default)]
    pub tags: Tags,
    pub position: LatLon,
    /// Last edit, epoch millis
    #[serde(default)]
    pub timestamp_edited: i64,
}

/// A line made of an ordered list of node references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Way {
    pub id: i64,
    pub version: i32,
    #[serde(default)]
    pub tags: Tags,
    pub node_ids: Vec<i64>,
    #[serde(default)]
    pub timestamp_edited: i64,
}

impl Way {
    /// First and last node are the same.
    pub fn is_closed(&self) -> bool {
        self.node_ids.len() >= 4 && self.node_ids.first() == self.node_ids.last()
    }
}

/// Typed member reference of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMember {
    pub kind: EntityKind,
    #[serde(rename = "ref")]
    pub ref_id: i64,
    #[serde(default)]
    pub role: String,
}

impl RelationMember {
    pub fn new(kind: EntityKind, ref_id: i64, role: impl Into<String>) -> Self {
        Self {
            kind,
            ref_id,
            role: role.into(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.ref_id)
    }
}

/// An ordered group of typed member references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub version: i32,
    #[serde(default)]
    pub tags: Tags,
    pub members: Vec<RelationMember>,
    #[serde(default)]
    pub timestamp_edited: i64,
}

/// Any map entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entity {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Node(_) => EntityKind::Node,
            Entity::Way(_) => EntityKind::Way,
            Entity::Relation(_) => EntityKind::Relation,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Entity::Node(n) => n.id,
            Entity::Way(w) => w.id,
            Entity::Relation(r) => r.id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id())
    }

    pub fn version(&self) -> i32 {
        match self {
            Entity::Node(n) => n.version,
            Entity::Way(w) => w.version,
            Entity::Relation(r) => r.version,
        }
    }

    pub fn tags(&self) -> &Tags {
        match self {
            Entity::Node(n) => &n.tags,
            Entity::Way(w) => &w.tags,
            Entity::Relation(r) => &r.tags,
        }
    }

    pub fn timestamp_edited(&self) -> i64 {
        match self {
            Entity::Node(n) => n.timestamp_edited,
            Entity::Way(w) => w.timestamp_edited,
            Entity::Relation(r) => r.timestamp_edited,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Entity::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_way(&self) -> Option<&Way> {
        match self {
            Entity::Way(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_relation(&self) -> Option<&Relation> {
        match self {
            Entity::Relation(r) => Some(r),
            _ => None,
        }
    }

    /// Node ids this entity points at directly (way nodes, node members).
    pub fn referenced_node_ids(&self) -> Vec<i64> {
        match self {
            Entity::Node(_) => Vec::new(),
            Entity::Way(w) => w.node_ids.clone(),
            Entity::Relation(r) => r
                .members
                .iter()
                .filter(|m| m.kind == EntityKind::Node)
                .map(|m| m.ref_id)
                .collect(),
        }
    }
}

impl From<Node> for Entity {
    fn from(n: Node) -> Self {
        Entity::Node(n)
    }
}

impl From<Way> for Entity {
    fn from(w: Way) -> Self {
        Entity::Way(w)
    }
}

impl From<Relation> for Entity {
    fn from(r: Relation) -> Self {
        Entity::Relation(r)
    }
}

/// `(EntityKey, Geometry)` pair, cached separately from tag data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryEntry {
    pub key: EntityKey,
    pub geometry: Geometry,
}

impl GeometryEntry {
    pub fn new(key: EntityKey, geometry: Geometry) -> Self {
        Self { key, geometry }
    }
}

/// Keyed batch of entities, optionally with the area it completely covers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapData {
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(with = "entity_list")]
    entities: HashMap<EntityKey, Entity>,
}

impl MapData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bbox(bbox: BoundingBox) -> Self {
        Self {
            bbox: Some(bbox),
            entities: HashMap::new(),
        }
    }

    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut data = Self::new();
        data.extend(entities);
        data
    }

    /// Insert or replace by key.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        self.entities.insert(entity.key(), entity)
    }

    pub fn extend(&mut self, entities: impl IntoIterator<Item = Entity>) {
        for entity in entities {
            self.insert(entity);
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<Entity> {
        self.entities.remove(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    pub fn node(&self, id: i64) -> Option<&Node> {
        self.get(&EntityKey::node(id)).and_then(Entity::as_node)
    }

    pub fn way(&self, id: i64) -> Option<&Way> {
        self.get(&EntityKey::way(id)).and_then(Entity::as_way)
    }

    pub fn relation(&self, id: i64) -> Option<&Relation> {
        self.get(&EntityKey::relation(id)).and_then(Entity::as_relation)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entities.keys()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn into_entities(self) -> impl Iterator<Item = Entity> {
        self.entities.into_values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.entities.values().filter_map(Entity::as_node)
    }

    pub fn ways(&self) -> impl Iterator<Item = &Way> {
        self.entities.values().filter_map(Entity::as_way)
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.entities.values().filter_map(Entity::as_relation)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Entities as a JSON list rather than a map keyed by `EntityKey`.
mod entity_list {
    use std::collections::HashMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Entity, EntityKey};

    pub fn serialize<S: Serializer>(
        entities: &HashMap<EntityKey, Entity>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut list: Vec<&Entity> = entities.values().collect();
        list.sort_by_key(|e| e.key());
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<EntityKey, Entity>, D::Error> {
        let list = Vec::<Entity>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|e| (e.key(), e)).collect())
    }
}

/// Map data together with the geometries computed for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapDataWithGeometry {
    pub data: MapData,
    pub geometries: HashMap<EntityKey, Geometry>,
}

impl MapDataWithGeometry {
    pub fn new(data: MapData, geometries: impl IntoIterator<Item = GeometryEntry>) -> Self {
        Self {
            data,
            geometries: geometries
                .into_iter()
                .map(|entry| (entry.key, entry.geometry))
                .collect(),
        }
    }

    pub fn geometry(&self, key: &EntityKey) -> Option<&Geometry> {
        self.geometries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.geometries.is_empty()
    }
}

/// Remote confirmation of a locally created entity under a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdUpdate {
    pub kind: EntityKind,
    pub old_id: i64,
    pub new_id: i64,
}

impl IdUpdate {
    pub fn old_key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.old_id)
    }

    pub fn new_key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.new_id)
    }
}

/// Incremental delta applied with `update_all`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapDataUpdates {
    #[serde(default)]
    pub updated: Vec<Entity>,
    #[serde(default)]
    pub deleted: Vec<EntityKey>,
    #[serde(default)]
    pub id_updates: Vec<IdUpdate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, lat: f64, lon: f64) -> Entity {
        Entity::Node(Node {
            id,
            version: 1,
            tags: Tags::new(),
            position: LatLon::new(lat, lon),
            timestamp_edited: 0,
        })
    }

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::way(42).to_string(), "way/42");
        assert_eq!(EntityKey::node(-1).to_string(), "node/-1");
    }

    #[test]
    fn test_map_data_insert_replaces_by_key() {
        let mut data = MapData::new();
        data.insert(node(1, 0.0, 0.0));
        data.insert(node(1, 1.0, 1.0));
        assert_eq!(data.len(), 1);
        assert_eq!(data.node(1).unwrap().position, LatLon::new(1.0, 1.0));
        assert!(data.way(1).is_none());
    }

    #[test]
    fn test_closed_way() {
        let way = Way {
            id: 1,
            version: 1,
            tags: Tags::new(),
            node_ids: vec![1, 2, 3, 1],
            timestamp_edited: 0,
        };
        assert!(way.is_closed());
    }

    #[test]
    fn test_referenced_node_ids() {
        let relation = Entity::Relation(Relation {
            id: 1,
            version: 1,
            tags: Tags::new(),
            members: vec![
                RelationMember::new(EntityKind::Node, 5, "label"),
                RelationMember::new(EntityKind::Way, 6, "outer"),
            ],
            timestamp_edited: 0,
        });
        assert_eq!(relation.referenced_node_ids(), vec![5]);
    }

    #[test]
    fn test_map_data_json_fixture() {
        let json = r#"{
            "bbox": {"min": {"lat": 0.0, "lon": 0.0}, "max": {"lat": 1.0, "lon": 1.0}},
            "entities": [
                {"type": "node", "id": 1, "version": 1, "position": {"lat": 0.5, "lon": 0.5}},
                {"type": "way", "id": 2, "version": 3, "tags": {"highway": "path"}, "node_ids": [1]}
            ]
        }"#;
        let data: MapData = serde_json::from_str(json).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.way(2).unwrap().tags["highway"], "path");
        assert_eq!(data.bbox, Some(BoundingBox::new(0.0, 0.0, 1.0, 1.0)));
    }
}
