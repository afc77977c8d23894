//! Map Data Controller
//!
//! Single entry point for reading and mutating map data. Mutations are
//! applied to the spatial cache under one exclusion section, announced to
//! listeners, and then persisted through the sequencer.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::{debug, info, instrument};

use super::completion;
use super::listeners::ListenerRegistry;
use super::ControllerConfig;
use crate::cache::{CacheStats, SpatialCache};
use crate::domain::{
    BoundingBox, CreatedElementsTracker, Entity, EntityKey, EntityKind, Geometry, GeometryCreator,
    GeometryEntry, MapData, MapDataListener, MapDataUpdates, MapDataWithGeometry, Node,
    PersistenceSignal, Relation, StoragePorts, Way,
};
use crate::error::Result;
use crate::persist::PersistenceSequencer;

/// Cache, storage and persistence orchestration
pub struct MapDataController {
    /// Exclusion section around cache mutation and storage writes
    global: Arc<ReentrantMutex<()>>,
    cache: Arc<SpatialCache>,
    storage: StoragePorts,
    geometry: Arc<dyn GeometryCreator>,
    tracker: Arc<dyn CreatedElementsTracker>,
    sequencer: PersistenceSequencer,
    listeners: ListenerRegistry,
}

impl std::fmt::Debug for MapDataController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapDataController")
            .field("cache", &self.cache)
            .field("sequencer", &self.sequencer)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

/// A durable write built by a mutation.
struct StorageWrite {
    deleted: Vec<EntityKey>,
    entities: Vec<Entity>,
    geometries: Vec<GeometryEntry>,
}

impl StorageWrite {
    fn apply(&self, storage: &StoragePorts) -> Result<()> {
        if !self.deleted.is_empty() {
            storage.delete_entities(&self.deleted)?;
        }
        storage.put_geometries(&self.geometries)?;

        // ways/relations that lost their geometry must not keep a stale one
        let with_geometry: HashSet<EntityKey> = self.geometries.iter().map(|g| g.key).collect();
        let stale: Vec<EntityKey> = self
            .entities
            .iter()
            .map(Entity::key)
            .filter(|k| k.kind != EntityKind::Node && !with_geometry.contains(k))
            .collect();
        if !stale.is_empty() {
            storage.geometries.delete_all(&stale)?;
        }

        storage.put_entities(&self.entities)
    }
}

impl MapDataController {
    /// Create a controller on the current tokio runtime.
    pub fn new(
        config: ControllerConfig,
        storage: StoragePorts,
        geometry: Arc<dyn GeometryCreator>,
        tracker: Arc<dyn CreatedElementsTracker>,
        signal: Option<Arc<dyn PersistenceSignal>>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = SpatialCache::with_config(config.cache, storage.clone())?;
        Ok(Self {
            global: Arc::new(ReentrantMutex::new(())),
            cache: Arc::new(cache),
            storage,
            geometry,
            tracker,
            sequencer: PersistenceSequencer::new(signal)?,
            listeners: ListenerRegistry::new(),
        })
    }

    pub fn cache(&self) -> &SpatialCache {
        &self.cache
    }

    pub fn sequencer(&self) -> &PersistenceSequencer {
        &self.sequencer
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Replace everything inside `bbox` with `new_data`.
    ///
    /// Entities previously known inside the covered area but absent from
    /// the completed batch are deleted. The covered area is `new_data.bbox`
    /// when set (a padded download area), `bbox` otherwise.
    #[instrument(skip(self, bbox, new_data), fields(bbox = %bbox, entities = new_data.len()))]
    pub fn replace_for_bbox(&self, bbox: &BoundingBox, mut new_data: MapData) -> Result<()> {
        bbox.validate()?;
        let coverage = new_data.bbox.unwrap_or(*bbox);

        let (payload, deleted, notify_pin) = {
            let _guard = self.global.lock();

            completion::complete(&mut new_data, self.cache.as_ref())?;
            let geometries = self.create_geometries(new_data.entities(), &new_data);

            let new_keys: HashSet<EntityKey> = new_data.keys().copied().collect();
            let mut previous: BTreeSet<EntityKey> =
                self.storage.keys_in_bbox(&coverage)?.into_iter().collect();
            // the cache may hold entities whose writes are still queued
            previous.extend(self.cache.keys_in_bbox(&coverage));
            let old_keys: Vec<EntityKey> = previous
                .into_iter()
                .filter(|k| !new_keys.contains(k))
                .collect();

            let entities: Vec<Entity> = new_data.entities().cloned().collect();
            // one pin for the listeners, one released by the write
            let notify_pin = self.cache.pin(bbox);
            self.cache.no_trim_plus(bbox);
            self.cache
                .update(&old_keys, &entities, &geometries, Some(&coverage));

            let deleted = old_keys.len();
            // enqueued inside the section so storage order matches cache order
            self.enqueue_write(
                "replace_for_bbox",
                StorageWrite {
                    deleted: old_keys,
                    entities,
                    geometries: geometries.clone(),
                },
                Some(*bbox),
            );
            (
                MapDataWithGeometry::new(new_data, geometries),
                deleted,
                notify_pin,
            )
        };

        info!(
            entities = payload.data.len(),
            geometries = payload.geometries.len(),
            deleted,
            "Replaced map data for bounding box"
        );
        self.listeners.notify_replaced_for_bbox(bbox, &payload);
        drop(notify_pin);
        Ok(())
    }

    /// Apply a diff of updated entities, deletions and id remaps.
    #[instrument(
        skip(self, updates),
        fields(
            updated = updates.updated.len(),
            deleted = updates.deleted.len(),
            id_updates = updates.id_updates.len()
        )
    )]
    pub fn update_all(&self, updates: MapDataUpdates) -> Result<()> {
        let MapDataUpdates {
            updated,
            deleted,
            id_updates,
        } = updates;
        if updated.is_empty() && deleted.is_empty() && id_updates.is_empty() {
            return Ok(());
        }

        let (payload, deleted, notify_pin) = {
            let _guard = self.global.lock();

            let mut context = MapData::from_entities(updated.iter().cloned());
            completion::complete(&mut context, self.cache.as_ref())?;
            let geometries = self.create_geometries(updated.iter(), &context);

            let updated_keys: HashSet<EntityKey> = updated.iter().map(Entity::key).collect();
            let deleted: Vec<EntityKey> = deleted
                .iter()
                .copied()
                .chain(id_updates.iter().map(|u| u.old_key()))
                .filter(|k| !updated_keys.contains(k))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            let pin = geometries
                .iter()
                .filter_map(|g| g.geometry.bounds())
                .reduce(|a, b| a.union(&b));
            let notify_pin = pin.as_ref().map(|p| self.cache.pin(p));
            if let Some(pin) = &pin {
                self.cache.no_trim_plus(pin);
            }
            self.cache.update(&deleted, &updated, &geometries, None);

            let created: Vec<EntityKey> = id_updates.iter().map(|u| u.new_key()).collect();
            if !created.is_empty() {
                self.tracker.track_created(&created);
            }

            self.enqueue_write(
                "update_all",
                StorageWrite {
                    deleted: deleted.clone(),
                    entities: updated.clone(),
                    geometries: geometries.clone(),
                },
                pin,
            );
            let payload = MapDataWithGeometry::new(MapData::from_entities(updated), geometries);
            (payload, deleted, notify_pin)
        };

        debug!(
            updated = payload.data.len(),
            deleted = deleted.len(),
            "Updated map data"
        );
        self.listeners.notify_updated(&payload, &deleted);
        drop(notify_pin);
        Ok(())
    }

    /// Delete entities last written before `timestamp`: relations, then
    /// ways, then nodes no remaining way references, `limit` in total.
    ///
    /// Runs behind every write enqueued before it. Returns the number of
    /// deleted entities.
    #[instrument(skip(self))]
    pub async fn delete_older_than(&self, timestamp: i64, limit: Option<usize>) -> Result<usize> {
        let global = self.global.clone();
        let storage = self.storage.clone();
        let cache = self.cache.clone();
        let tracker = self.tracker.clone();

        let deleted = self
            .sequencer
            .submit("delete_older_than", move || {
                let _guard = global.lock();
                let mut remaining = limit;

                let relations = storage.relations.ids_older_than(timestamp, remaining)?;
                consume(&mut remaining, relations.len());
                let ways = match remaining {
                    Some(0) => Vec::new(),
                    _ => storage.ways.ids_older_than(timestamp, remaining)?,
                };
                consume(&mut remaining, ways.len());

                let mut keys: Vec<EntityKey> = relations
                    .into_iter()
                    .map(EntityKey::relation)
                    .chain(ways.into_iter().map(EntityKey::way))
                    .collect();
                // nodes are filtered against the ways that survive
                storage.delete_entities(&keys)?;

                let nodes = match remaining {
                    Some(0) => Vec::new(),
                    _ => storage.nodes.ids_older_than(timestamp, remaining)?,
                };
                let nodes = storage.nodes.filter_ids_without_ways(&nodes)?;
                storage.nodes.delete_all(&nodes)?;
                keys.extend(nodes.into_iter().map(EntityKey::node));

                cache.update(&keys, &[], &[], None);
                tracker.untrack(&keys);
                Ok(keys)
            })
            .await?;

        info!(count = deleted.len(), timestamp, "Deleted old map data");
        self.listeners
            .notify_updated(&MapDataWithGeometry::default(), &deleted);
        Ok(deleted.len())
    }

    /// Drop everything from the cache, the tracker and storage.
    #[instrument(skip(self))]
    pub fn clear(&self) {
        {
            let _guard = self.global.lock();
            self.cache.clear();
            self.tracker.clear();

            let global = self.global.clone();
            let storage = self.storage.clone();
            self.sequencer.enqueue("clear", move || {
                let _guard = global.lock();
                storage.clear_all()
            });
        }
        info!("Cleared map data");
        self.listeners.notify_cleared();
    }

    /// Resolves once every write issued so far is persisted.
    pub async fn flush(&self) {
        self.sequencer.flush().await;
    }

    fn create_geometries<'a>(
        &self,
        entities: impl Iterator<Item = &'a Entity>,
        context: &MapData,
    ) -> Vec<GeometryEntry> {
        entities
            .filter_map(|e| {
                self.geometry
                    .create(e, context, true)
                    .map(|g| GeometryEntry::new(e.key(), g))
            })
            .collect()
    }

    fn enqueue_write(&self, label: &'static str, write: StorageWrite, pin: Option<BoundingBox>) {
        let global = self.global.clone();
        let storage = self.storage.clone();
        let cache = self.cache.clone();
        self.sequencer.enqueue(label, move || {
            let result = {
                let _guard = global.lock();
                write.apply(&storage)
            };
            // released even when the write failed
            if let Some(pin) = pin {
                cache.no_trim_minus(&pin);
            }
            result
        });
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        self.cache.get_entity(key)
    }

    pub fn get_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        self.cache.get_entities(keys)
    }

    pub fn get_node(&self, id: i64) -> Result<Option<Node>> {
        Ok(self.cache.get_nodes(&[id])?.pop())
    }

    pub fn get_way(&self, id: i64) -> Result<Option<Way>> {
        Ok(self.cache.get_ways(&[id])?.pop())
    }

    pub fn get_relation(&self, id: i64) -> Result<Option<Relation>> {
        Ok(self.cache.get_relations(&[id])?.pop())
    }

    pub fn get_nodes(&self, ids: &[i64]) -> Result<Vec<Node>> {
        self.cache.get_nodes(ids)
    }

    pub fn get_ways(&self, ids: &[i64]) -> Result<Vec<Way>> {
        self.cache.get_ways(ids)
    }

    pub fn get_relations(&self, ids: &[i64]) -> Result<Vec<Relation>> {
        self.cache.get_relations(ids)
    }

    pub fn get_geometry(&self, key: &EntityKey) -> Result<Option<Geometry>> {
        self.cache.get_geometry(key)
    }

    pub fn get_geometries(&self, keys: &[EntityKey]) -> Result<Vec<GeometryEntry>> {
        self.cache.get_geometries(keys)
    }

    pub fn get_map_data_in_bbox(&self, bbox: &BoundingBox) -> Result<MapDataWithGeometry> {
        bbox.validate()?;
        self.cache.get_map_data_in_bbox(bbox)
    }

    pub fn get_ways_for_node(&self, node_id: i64) -> Result<Vec<Way>> {
        self.cache.get_ways_for_node(node_id)
    }

    pub fn get_relations_for_node(&self, node_id: i64) -> Result<Vec<Relation>> {
        self.cache.get_relations_for_entity(&EntityKey::node(node_id))
    }

    pub fn get_relations_for_way(&self, way_id: i64) -> Result<Vec<Relation>> {
        self.cache.get_relations_for_entity(&EntityKey::way(way_id))
    }

    pub fn get_relations_for_relation(&self, relation_id: i64) -> Result<Vec<Relation>> {
        self.cache
            .get_relations_for_entity(&EntityKey::relation(relation_id))
    }

    /// The way with all its nodes, or `None` if any node is unknown.
    pub fn get_way_complete(&self, id: i64) -> Result<Option<MapData>> {
        let Some(way) = self.cache.get_ways(&[id])?.pop() else {
            return Ok(None);
        };
        let Some(nodes) = self.resolve_nodes(way.node_ids.iter().copied())? else {
            return Ok(None);
        };
        let mut data = MapData::from_entities(nodes.into_iter().map(Entity::Node));
        data.insert(Entity::Way(way));
        Ok(Some(data))
    }

    /// The relation with its member nodes and ways plus the nodes of those
    /// ways, or `None` if any of them is unknown. Member relations are not
    /// included.
    pub fn get_relation_complete(&self, id: i64) -> Result<Option<MapData>> {
        let Some(relation) = self.cache.get_relations(&[id])?.pop() else {
            return Ok(None);
        };

        let way_ids: BTreeSet<i64> = relation
            .members
            .iter()
            .filter(|m| m.kind == EntityKind::Way)
            .map(|m| m.ref_id)
            .collect();
        let ways = self
            .cache
            .get_ways(&way_ids.iter().copied().collect::<Vec<_>>())?;
        if ways.len() != way_ids.len() {
            return Ok(None);
        }

        let node_ids = relation
            .members
            .iter()
            .filter(|m| m.kind == EntityKind::Node)
            .map(|m| m.ref_id)
            .chain(ways.iter().flat_map(|w| w.node_ids.iter().copied()));
        let Some(nodes) = self.resolve_nodes(node_ids)? else {
            return Ok(None);
        };

        let mut data = MapData::from_entities(nodes.into_iter().map(Entity::Node));
        data.extend(ways.into_iter().map(Entity::Way));
        data.insert(Entity::Relation(relation));
        Ok(Some(data))
    }

    /// All nodes for `ids`, or `None` if one is missing.
    fn resolve_nodes(&self, ids: impl Iterator<Item = i64>) -> Result<Option<Vec<Node>>> {
        let ids: BTreeSet<i64> = ids.collect();
        let nodes = self
            .cache
            .get_nodes(&ids.iter().copied().collect::<Vec<_>>())?;
        Ok((nodes.len() == ids.len()).then_some(nodes))
    }

    // =========================================================================
    // Listeners and maintenance
    // =========================================================================

    pub fn add_listener(&self, listener: Arc<dyn MapDataListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MapDataListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Shrink the cache to at most `target` tiles, e.g. under memory
    /// pressure.
    pub fn trim(&self, target: usize) {
        self.cache.trim(target);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn pending_writes(&self) -> usize {
        self.sequencer.pending()
    }

    pub fn failed_writes(&self) -> u64 {
        self.sequencer.failed_writes()
    }
}

/// Subtract `used` from a remaining quota.
fn consume(remaining: &mut Option<usize>, used: usize) {
    if let Some(r) = remaining {
        *r = r.saturating_sub(used);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        InMemoryCreatedElementsTracker, InMemoryMapStore, RecordingListener,
        SimpleGeometryCreator,
    };
    use crate::domain::{IdUpdate, LatLon, MapDataEvent, RelationMember, Tags};

    fn node(id: i64, lat: f64, lon: f64) -> Entity {
        Entity::Node(Node {
            id,
            version: 1,
            tags: Tags::new(),
            position: LatLon::new(lat, lon),
            timestamp_edited: 0,
        })
    }

    fn way(id: i64, node_ids: Vec<i64>) -> Entity {
        Entity::Way(Way {
            id,
            version: 1,
            tags: Tags::new(),
            node_ids,
            timestamp_edited: 0,
        })
    }

    struct Fixture {
        controller: MapDataController,
        store: Arc<InMemoryMapStore>,
        tracker: Arc<InMemoryCreatedElementsTracker>,
        recorder: Arc<RecordingListener>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryMapStore::new());
        let tracker = Arc::new(InMemoryCreatedElementsTracker::new());
        let recorder = Arc::new(RecordingListener::new());
        let controller = MapDataController::new(
            ControllerConfig::default(),
            StoragePorts::from_store(store.clone()),
            Arc::new(SimpleGeometryCreator::new()),
            tracker.clone(),
            None,
        )
        .unwrap();
        controller.add_listener(recorder.clone());
        Fixture {
            controller,
            store,
            tracker,
            recorder,
        }
    }

    fn area() -> BoundingBox {
        BoundingBox::new(52.5, 13.4, 52.51, 13.41)
    }

    #[tokio::test]
    async fn test_replace_for_bbox_persists_and_notifies() {
        let f = fixture();
        let data = MapData::from_entities([
            node(1, 52.501, 13.401),
            node(2, 52.502, 13.402),
            way(10, vec![1, 2]),
        ]);
        f.controller.replace_for_bbox(&area(), data).unwrap();
        f.controller.flush().await;

        assert_eq!(f.store.stats().nodes, 2);
        assert_eq!(f.store.geometry_keys(), vec![EntityKey::way(10)]);
        assert_eq!(f.recorder.events_of_type("ReplacedForBBox").len(), 1);

        let read = f.controller.get_map_data_in_bbox(&area()).unwrap();
        assert_eq!(read.data.len(), 3);
    }

    #[tokio::test]
    async fn test_replace_deletes_entities_missing_from_new_data() {
        let f = fixture();
        f.store.insert_entity(node(5, 52.505, 13.405));

        let data = MapData::from_entities([node(1, 52.501, 13.401)]);
        f.controller.replace_for_bbox(&area(), data).unwrap();
        f.controller.flush().await;

        assert!(f.store.snapshot().node(5).is_none());
        assert!(f.controller.get_node(5).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_all_remaps_ids() {
        let f = fixture();
        f.controller
            .update_all(MapDataUpdates {
                updated: vec![node(-1, 52.501, 13.401)],
                ..Default::default()
            })
            .unwrap();

        f.controller
            .update_all(MapDataUpdates {
                updated: vec![node(42, 52.501, 13.401)],
                deleted: vec![],
                id_updates: vec![IdUpdate {
                    kind: EntityKind::Node,
                    old_id: -1,
                    new_id: 42,
                }],
            })
            .unwrap();
        f.controller.flush().await;

        assert!(f.tracker.contains(&EntityKey::node(42)));
        let stored = f.store.snapshot();
        assert!(stored.node(42).is_some());
        assert!(stored.node(-1).is_none());

        let events = f.recorder.events_of_type("Updated");
        assert_eq!(events.len(), 2);
        match &events[1] {
            MapDataEvent::Updated { deleted, .. } => {
                assert_eq!(deleted, &vec![EntityKey::node(-1)]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_update_is_a_no_op() {
        let f = fixture();
        f.controller.update_all(MapDataUpdates::default()).unwrap();
        assert!(f.recorder.is_empty());
        assert_eq!(f.controller.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_get_way_complete() {
        let f = fixture();
        f.store.insert_entity(node(1, 52.501, 13.401));
        f.store.insert_entity(node(2, 52.502, 13.402));
        f.store.insert_entity(way(10, vec![1, 2]));
        f.store.insert_entity(way(11, vec![1, 3]));

        let complete = f.controller.get_way_complete(10).unwrap().unwrap();
        assert_eq!(complete.len(), 3);
        assert!(f.controller.get_way_complete(11).unwrap().is_none());
        assert!(f.controller.get_way_complete(99).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_reads_do_not_wait_for_global_section() {
        let f = fixture();
        f.store.insert_entity(node(1, 52.501, 13.401));
        f.store.insert_entity(node(2, 52.502, 13.402));
        f.store.insert_entity(way(10, vec![1, 2]));
        f.store.insert_entity(Entity::Relation(Relation {
            id: 20,
            version: 1,
            tags: Tags::new(),
            members: vec![RelationMember {
                kind: EntityKind::Way,
                ref_id: 10,
                role: "outer".into(),
            }],
            timestamp_edited: 0,
        }));

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let global = f.controller.global.clone();
        let controller = &f.controller;

        std::thread::scope(|s| {
            s.spawn(move || {
                let _guard = global.lock();
                held_tx.send(()).unwrap();
                let _ = release_rx.recv();
            });
            held_rx.recv().unwrap();

            s.spawn(move || {
                let way = controller.get_way_complete(10).unwrap().map(|d| d.len());
                let relation = controller.get_relation_complete(20).unwrap().map(|d| d.len());
                let _ = done_tx.send((way, relation));
            });
            let reads = done_rx.recv_timeout(std::time::Duration::from_secs(5));
            release_tx.send(()).unwrap();
            assert_eq!(reads, Ok((Some(3), Some(4))));
        });
    }

    #[tokio::test]
    async fn test_clear_empties_everything() {
        let f = fixture();
        f.controller
            .update_all(MapDataUpdates {
                updated: vec![node(1, 52.501, 13.401)],
                ..Default::default()
            })
            .unwrap();
        f.controller.clear();
        f.controller.flush().await;

        assert_eq!(f.store.stats().nodes, 0);
        assert!(f.controller.get_node(1).unwrap().is_none());
        assert_eq!(f.recorder.events_of_type("Cleared").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_releases_pin() {
        let f = fixture();
        f.store.set_fail_writes(true);
        f.controller
            .replace_for_bbox(&area(), MapData::from_entities([node(1, 52.501, 13.401)]))
            .unwrap();
        f.controller.flush().await;

        assert_eq!(f.controller.failed_writes(), 1);
        assert_eq!(f.controller.cache_stats().pinned_tiles, 0);
    }
}
