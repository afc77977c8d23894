//! In-Memory Map Store
//!
//! Implements every storage port over concurrent hash maps. Used by the
//! binary's demo run and by tests; a database-backed store plugs into the
//! same ports.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::domain::{
    BoundingBox, Entity, EntityKey, EntityKind, Geometry, GeometryEntry, GeometryRepository,
    MapData, Node, NodeRepository, Relation, RelationRepository, Way, WayRepository,
};
use crate::error::{Error, Result};

/// A stored value with the time it was last written.
#[derive(Debug, Clone)]
struct Stored<T> {
    value: T,
    last_sync: i64,
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub nodes: usize,
    pub ways: usize,
    pub relations: usize,
    pub geometries: usize,
    pub reads: u64,
    pub writes: u64,
}

/// In-memory implementation of all repository ports
#[derive(Debug, Default)]
pub struct InMemoryMapStore {
    nodes: DashMap<i64, Stored<Node>>,
    ways: DashMap<i64, Stored<Way>>,
    relations: DashMap<i64, Stored<Relation>>,
    geometries: DashMap<EntityKey, Geometry>,
    /// Fixed clock in milliseconds; wall clock when unset
    clock: RwLock<Option<i64>>,
    /// Reject every write, for exercising failure handling
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the clock used to stamp writes.
    pub fn set_time(&self, millis: i64) {
        *self.clock.write() = Some(millis);
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn now(&self) -> i64 {
        let fixed = *self.clock.read();
        fixed.unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
    }

    fn check_writable(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage("store is rejecting writes"));
        }
        Ok(())
    }

    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Store an entity directly, stamped with the current clock.
    pub fn insert_entity(&self, entity: Entity) {
        let last_sync = self.now();
        match entity {
            Entity::Node(n) => {
                self.nodes.insert(n.id, Stored { value: n, last_sync });
            }
            Entity::Way(w) => {
                self.ways.insert(w.id, Stored { value: w, last_sync });
            }
            Entity::Relation(r) => {
                self.relations.insert(r.id, Stored { value: r, last_sync });
            }
        }
    }

    pub fn insert_geometry(&self, key: EntityKey, geometry: Geometry) {
        self.geometries.insert(key, geometry);
    }

    /// Every stored entity.
    pub fn snapshot(&self) -> MapData {
        let mut data = MapData::new();
        data.extend(self.nodes.iter().map(|e| Entity::Node(e.value().value.clone())));
        data.extend(self.ways.iter().map(|e| Entity::Way(e.value().value.clone())));
        data.extend(
            self.relations
                .iter()
                .map(|e| Entity::Relation(e.value().value.clone())),
        );
        data
    }

    /// Keys of every stored geometry, sorted.
    pub fn geometry_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.geometries.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            nodes: self.nodes.len(),
            ways: self.ways.len(),
            relations: self.relations.len(),
            geometries: self.geometries.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Ids stamped before `timestamp`, oldest first.
fn older_than<T>(
    map: &DashMap<i64, Stored<T>>,
    timestamp: i64,
    limit: Option<usize>,
) -> Vec<i64> {
    let mut found: Vec<(i64, i64)> = map
        .iter()
        .filter(|e| e.value().last_sync < timestamp)
        .map(|e| (e.value().last_sync, *e.key()))
        .collect();
    found.sort_unstable();
    let ids = found.into_iter().map(|(_, id)| id);
    match limit {
        Some(limit) => ids.take(limit).collect(),
        None => ids.collect(),
    }
}

fn get_many<T: Clone>(map: &DashMap<i64, Stored<T>>, ids: &[i64]) -> Vec<T> {
    ids.iter()
        .filter_map(|id| map.get(id).map(|e| e.value().value.clone()))
        .collect()
}

fn delete_many<T>(map: &DashMap<i64, Stored<T>>, ids: &[i64]) -> usize {
    ids.iter().filter(|id| map.remove(*id).is_some()).count()
}

impl NodeRepository for InMemoryMapStore {
    fn get(&self, id: i64) -> Result<Option<Node>> {
        self.record_read();
        Ok(self.nodes.get(&id).map(|e| e.value().value.clone()))
    }

    fn get_all(&self, ids: &[i64]) -> Result<Vec<Node>> {
        self.record_read();
        Ok(get_many(&self.nodes, ids))
    }

    fn get_all_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<Node>> {
        self.record_read();
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|e| bbox.contains(&e.value().value.position))
            .map(|e| e.value().value.clone())
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    fn ids_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<i64>> {
        Ok(NodeRepository::get_all_in_bbox(self, bbox)?
            .into_iter()
            .map(|n| n.id)
            .collect())
    }

    fn put_all(&self, nodes: &[Node]) -> Result<()> {
        self.check_writable()?;
        let last_sync = self.now();
        for node in nodes {
            self.nodes.insert(
                node.id,
                Stored {
                    value: node.clone(),
                    last_sync,
                },
            );
        }
        trace!(count = nodes.len(), "Stored nodes");
        Ok(())
    }

    fn delete_all(&self, ids: &[i64]) -> Result<usize> {
        self.check_writable()?;
        Ok(delete_many(&self.nodes, ids))
    }

    fn ids_older_than(&self, timestamp: i64, limit: Option<usize>) -> Result<Vec<i64>> {
        self.record_read();
        Ok(older_than(&self.nodes, timestamp, limit))
    }

    fn filter_ids_without_ways(&self, ids: &[i64]) -> Result<Vec<i64>> {
        self.record_read();
        let referenced: std::collections::HashSet<i64> = self
            .ways
            .iter()
            .flat_map(|e| e.value().value.node_ids.clone())
            .collect();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| !referenced.contains(id))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.check_writable()?;
        self.nodes.clear();
        Ok(())
    }
}

impl WayRepository for InMemoryMapStore {
    fn get(&self, id: i64) -> Result<Option<Way>> {
        self.record_read();
        Ok(self.ways.get(&id).map(|e| e.value().value.clone()))
    }

    fn get_all(&self, ids: &[i64]) -> Result<Vec<Way>> {
        self.record_read();
        Ok(get_many(&self.ways, ids))
    }

    fn get_all_for_node(&self, node_id: i64) -> Result<Vec<Way>> {
        self.record_read();
        let mut ways: Vec<Way> = self
            .ways
            .iter()
            .filter(|e| e.value().value.node_ids.contains(&node_id))
            .map(|e| e.value().value.clone())
            .collect();
        ways.sort_by_key(|w| w.id);
        Ok(ways)
    }

    fn put_all(&self, ways: &[Way]) -> Result<()> {
        self.check_writable()?;
        let last_sync = self.now();
        for way in ways {
            self.ways.insert(
                way.id,
                Stored {
                    value: way.clone(),
                    last_sync,
                },
            );
        }
        Ok(())
    }

    fn delete_all(&self, ids: &[i64]) -> Result<usize> {
        self.check_writable()?;
        Ok(delete_many(&self.ways, ids))
    }

    fn ids_older_than(&self, timestamp: i64, limit: Option<usize>) -> Result<Vec<i64>> {
        self.record_read();
        Ok(older_than(&self.ways, timestamp, limit))
    }

    fn clear(&self) -> Result<()> {
        self.check_writable()?;
        self.ways.clear();
        Ok(())
    }
}

impl RelationRepository for InMemoryMapStore {
    fn get(&self, id: i64) -> Result<Option<Relation>> {
        self.record_read();
        Ok(self.relations.get(&id).map(|e| e.value().value.clone()))
    }

    fn get_all(&self, ids: &[i64]) -> Result<Vec<Relation>> {
        self.record_read();
        Ok(get_many(&self.relations, ids))
    }

    fn get_all_for_entity(&self, key: &EntityKey) -> Result<Vec<Relation>> {
        self.record_read();
        let mut relations: Vec<Relation> = self
            .relations
            .iter()
            .filter(|e| e.value().value.members.iter().any(|m| m.key() == *key))
            .map(|e| e.value().value.clone())
            .collect();
        relations.sort_by_key(|r| r.id);
        Ok(relations)
    }

    fn put_all(&self, relations: &[Relation]) -> Result<()> {
        self.check_writable()?;
        let last_sync = self.now();
        for relation in relations {
            self.relations.insert(
                relation.id,
                Stored {
                    value: relation.clone(),
                    last_sync,
                },
            );
        }
        Ok(())
    }

    fn delete_all(&self, ids: &[i64]) -> Result<usize> {
        self.check_writable()?;
        Ok(delete_many(&self.relations, ids))
    }

    fn ids_older_than(&self, timestamp: i64, limit: Option<usize>) -> Result<Vec<i64>> {
        self.record_read();
        Ok(older_than(&self.relations, timestamp, limit))
    }

    fn clear(&self) -> Result<()> {
        self.check_writable()?;
        self.relations.clear();
        Ok(())
    }
}

impl GeometryRepository for InMemoryMapStore {
    fn get(&self, key: &EntityKey) -> Result<Option<Geometry>> {
        self.record_read();
        Ok(self.geometries.get(key).map(|g| g.clone()))
    }

    fn get_all(&self, keys: &[EntityKey]) -> Result<Vec<GeometryEntry>> {
        self.record_read();
        Ok(keys
            .iter()
            .filter_map(|k| {
                self.geometries
                    .get(k)
                    .map(|g| GeometryEntry::new(*k, g.clone()))
            })
            .collect())
    }

    fn get_all_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<GeometryEntry>> {
        self.record_read();
        let mut entries: Vec<GeometryEntry> = self
            .geometries
            .iter()
            .filter(|e| e.value().bounds().is_some_and(|b| b.intersects(bbox)))
            .map(|e| GeometryEntry::new(*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|e| e.key);
        Ok(entries)
    }

    fn keys_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<EntityKey>> {
        Ok(GeometryRepository::get_all_in_bbox(self, bbox)?
            .into_iter()
            .map(|e| e.key)
            .collect())
    }

    fn put_all(&self, entries: &[GeometryEntry]) -> Result<()> {
        self.check_writable()?;
        for entry in entries.iter().filter(|e| e.key.kind != EntityKind::Node) {
            self.geometries.insert(entry.key, entry.geometry.clone());
        }
        Ok(())
    }

    fn delete_all(&self, keys: &[EntityKey]) -> Result<usize> {
        self.check_writable()?;
        Ok(keys
            .iter()
            .filter(|k| self.geometries.remove(*k).is_some())
            .count())
    }

    fn clear(&self) -> Result<()> {
        self.check_writable()?;
        self.geometries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LatLon, RelationMember, Tags};
    use assert_matches::assert_matches;

    fn node(id: i64, lat: f64, lon: f64) -> Node {
        Node {
            id,
            version: 1,
            tags: Tags::new(),
            position: LatLon::new(lat, lon),
            timestamp_edited: 0,
        }
    }

    fn way(id: i64, node_ids: Vec<i64>) -> Way {
        Way {
            id,
            version: 1,
            tags: Tags::new(),
            node_ids,
            timestamp_edited: 0,
        }
    }

    #[test]
    fn test_nodes_in_bbox() {
        let store = InMemoryMapStore::new();
        NodeRepository::put_all(&store, &[node(1, 0.5, 0.5), node(2, 2.0, 2.0)]).unwrap();

        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(store.ids_in_bbox(&bbox).unwrap(), vec![1]);
    }

    #[test]
    fn test_ids_older_than_respects_limit() {
        let store = InMemoryMapStore::new();
        store.set_time(100);
        NodeRepository::put_all(&store, &[node(1, 0.0, 0.0)]).unwrap();
        store.set_time(200);
        NodeRepository::put_all(&store, &[node(2, 0.0, 0.0)]).unwrap();
        store.set_time(300);
        NodeRepository::put_all(&store, &[node(3, 0.0, 0.0)]).unwrap();

        assert_eq!(NodeRepository::ids_older_than(&store, 250, None).unwrap(), vec![1, 2]);
        assert_eq!(NodeRepository::ids_older_than(&store, 250, Some(1)).unwrap(), vec![1]);
    }

    #[test]
    fn test_filter_ids_without_ways() {
        let store = InMemoryMapStore::new();
        WayRepository::put_all(&store, &[way(10, vec![1, 2])]).unwrap();
        assert_eq!(store.filter_ids_without_ways(&[1, 2, 3]).unwrap(), vec![3]);
    }

    #[test]
    fn test_relations_for_entity() {
        let store = InMemoryMapStore::new();
        let relation = Relation {
            id: 5,
            version: 1,
            tags: Tags::new(),
            members: vec![RelationMember::new(EntityKind::Way, 10, "outer")],
            timestamp_edited: 0,
        };
        RelationRepository::put_all(&store, &[relation]).unwrap();

        let found = store.get_all_for_entity(&EntityKey::way(10)).unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.get_all_for_entity(&EntityKey::node(10)).unwrap().is_empty());
    }

    #[test]
    fn test_node_geometries_are_not_stored() {
        let store = InMemoryMapStore::new();
        let point = Geometry::Point(LatLon::new(1.0, 1.0));
        GeometryRepository::put_all(
            &store,
            &[
                GeometryEntry::new(EntityKey::node(1), point.clone()),
                GeometryEntry::new(EntityKey::way(1), Geometry::Polylines(vec![vec![
                    LatLon::new(0.0, 0.0),
                    LatLon::new(1.0, 1.0),
                ]])),
            ],
        )
        .unwrap();
        assert_eq!(store.geometry_keys(), vec![EntityKey::way(1)]);
    }

    #[test]
    fn test_failing_writes() {
        let store = InMemoryMapStore::new();
        store.set_fail_writes(true);
        let result = NodeRepository::put_all(&store, &[node(1, 0.0, 0.0)]);
        assert_matches!(result, Err(Error::Storage(_)));
        assert_eq!(store.stats().nodes, 0);
    }
}
