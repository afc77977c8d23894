//! Spatial Tile Cache
//!
//! Capacity-bounded, tile-indexed store of entities and geometries that
//! reads through to the storage ports on a miss.
//!
//! # Design
//!
//! - Entities and geometries are stored once; tiles hold keys only
//! - An entity is placed in every loaded tile its bounds touch; entities
//!   without known bounds (or outside loaded tiles) are kept as loose
//!   entries until the next eviction or explicit trim, unless they lie in
//!   a pinned area; loading a tile places every cached entity touching it
//! - Each tile indexes which of its ways/relations depend on a node
//!   (relations through their member ways too), so node updates can
//!   invalidate dependent geometries
//! - Coverage and pins over areas larger than the capacity never
//!   materialise per-tile state
//! - LRU eviction by tile, skipping pinned tiles; ties broken by insertion
//!   order

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::metrics::{CacheMetrics, CacheStats};
use super::tile::{TilePos, TilesRect, MAX_ZOOM};
use super::{DEFAULT_MAX_TILES, DEFAULT_TILE_ZOOM};
use crate::domain::{
    BoundingBox, Entity, EntityKey, EntityKind, EntitySource, Geometry, GeometryEntry, MapData,
    MapDataWithGeometry, Node, Relation, StoragePorts, Way,
};
use crate::error::{Error, Result};

/// Spatial cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Zoom level of the cache tiles
    pub tile_zoom: u8,
    /// Tile count the cache trims itself down to after loading tiles
    pub max_tiles: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tile_zoom: DEFAULT_TILE_ZOOM,
            max_tiles: DEFAULT_MAX_TILES,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tiles == 0 {
            return Err(Error::Config("max_tiles must be at least 1".into()));
        }
        if self.tile_zoom > MAX_ZOOM {
            return Err(Error::Config(format!(
                "tile_zoom {} exceeds maximum {}",
                self.tile_zoom, MAX_ZOOM
            )));
        }
        Ok(())
    }
}

/// One loaded tile
#[derive(Debug, Default)]
struct Tile {
    /// Entities whose bounds touch this tile
    keys: HashSet<EntityKey>,
    /// Node id -> ways/relations in this tile referencing that node
    node_refs: HashMap<i64, HashSet<EntityKey>>,
    /// Logical time of the last read or write
    last_access: u64,
    /// Insertion sequence, eviction tie-break
    inserted: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    tiles: HashMap<TilePos, Tile>,
    /// Pin ref-counts, kept independently of whether the tile is loaded
    pins: HashMap<TilePos, usize>,
    /// Pins over areas larger than the cache capacity, one entry per pin
    wide_pins: Vec<TilesRect>,
    entities: HashMap<EntityKey, Entity>,
    /// Way and relation geometries; node geometries derive from positions
    geometries: HashMap<EntityKey, Geometry>,
    /// Tiles each placed entity lives in
    placements: HashMap<EntityKey, HashSet<TilePos>>,
    /// Node ids each placed entity was indexed under in `Tile::node_refs`
    indexed_nodes: HashMap<EntityKey, Vec<i64>>,
    clock: u64,
    next_seq: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch<'a>(&mut self, tiles: impl IntoIterator<Item = &'a TilePos>) {
        let now = self.tick();
        for pos in tiles {
            if let Some(tile) = self.tiles.get_mut(pos) {
                tile.last_access = now;
            }
        }
    }

    fn pin_count(&self, pos: &TilePos) -> usize {
        let wide = self.wide_pins.iter().filter(|r| r.contains(pos)).count();
        self.pins.get(pos).copied().unwrap_or(0) + wide
    }

    fn is_pinned(&self, pos: &TilePos) -> bool {
        self.pin_count(pos) > 0
    }

    /// Whether any tile of `rect` is pinned, loaded or not.
    fn touches_pin(&self, rect: &TilesRect) -> bool {
        self.pins.keys().any(|pos| rect.contains(pos))
            || self.wide_pins.iter().any(|w| w.intersects(rect))
    }

    /// Node ids whose change makes the geometry of `key` stale: way nodes,
    /// node members, and the nodes of cached member ways.
    fn dependent_nodes(&self, key: &EntityKey) -> Vec<i64> {
        let Some(entity) = self.entities.get(key) else {
            return Vec::new();
        };
        let mut ids = entity.referenced_node_ids();
        if let Entity::Relation(relation) = entity {
            for member in relation.members.iter().filter(|m| m.kind == EntityKind::Way) {
                if let Some(Entity::Way(way)) = self.entities.get(&member.key()) {
                    ids.extend(way.node_ids.iter().copied());
                }
            }
            ids.sort_unstable();
            ids.dedup();
        }
        ids
    }

    fn load_tile(&mut self, pos: TilePos) -> bool {
        if self.tiles.contains_key(&pos) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let now = self.tick();
        self.tiles.insert(
            pos,
            Tile {
                last_access: now,
                inserted: seq,
                ..Default::default()
            },
        );
        true
    }

    /// Loaded tiles inside `rect`, iterating whichever side is smaller.
    fn loaded_tiles_in(&self, rect: &TilesRect) -> Vec<TilePos> {
        if rect.size() <= self.tiles.len() {
            rect.tiles().filter(|t| self.tiles.contains_key(t)).collect()
        } else {
            self.tiles.keys().filter(|t| rect.contains(t)).copied().collect()
        }
    }

    fn bounds_of(&self, key: &EntityKey) -> Option<BoundingBox> {
        match key.kind {
            EntityKind::Node => self
                .entities
                .get(key)
                .and_then(Entity::as_node)
                .map(|n| BoundingBox::new(n.position.lat, n.position.lon, n.position.lat, n.position.lon)),
            _ => self.geometries.get(key).and_then(Geometry::bounds),
        }
    }

    fn geometry_of(&self, key: &EntityKey) -> Option<Geometry> {
        match key.kind {
            EntityKind::Node => self
                .entities
                .get(key)
                .and_then(Entity::as_node)
                .map(|n| Geometry::Point(n.position)),
            _ => self.geometries.get(key).cloned(),
        }
    }

    /// Put `key` into every loaded tile its bounds touch.
    fn place(&mut self, key: EntityKey, zoom: u8) {
        let Some(bounds) = self.bounds_of(&key) else {
            return;
        };
        let rect = TilesRect::covering(&bounds, zoom);
        let targets = self.loaded_tiles_in(&rect);
        if targets.is_empty() {
            return;
        }
        let referenced = match self.indexed_nodes.get(&key) {
            Some(ids) => ids.clone(),
            None => {
                let ids = self.dependent_nodes(&key);
                self.indexed_nodes.insert(key, ids.clone());
                ids
            }
        };

        let placed = self.placements.entry(key).or_default();
        for pos in targets {
            if !placed.insert(pos) {
                continue;
            }
            if let Some(tile) = self.tiles.get_mut(&pos) {
                tile.keys.insert(key);
                for node_id in &referenced {
                    tile.node_refs.entry(*node_id).or_default().insert(key);
                }
            }
        }
    }

    /// Remove `key` from every tile and from the back-reference index.
    fn unplace(&mut self, key: &EntityKey) {
        let Some(placed) = self.placements.remove(key) else {
            return;
        };
        let referenced = self.indexed_nodes.remove(key).unwrap_or_default();
        for pos in placed {
            let Some(tile) = self.tiles.get_mut(&pos) else {
                continue;
            };
            tile.keys.remove(key);
            for node_id in &referenced {
                if let Some(refs) = tile.node_refs.get_mut(node_id) {
                    refs.remove(key);
                    if refs.is_empty() {
                        tile.node_refs.remove(node_id);
                    }
                }
            }
        }
    }

    fn remove_entity(&mut self, key: &EntityKey) {
        self.unplace(key);
        self.entities.remove(key);
        self.geometries.remove(key);
    }

    /// Insert a value read from storage unless a (newer) cached one exists.
    fn insert_fetched(&mut self, entity: Entity, zoom: u8) -> Entity {
        let key = entity.key();
        if let Some(cached) = self.entities.get(&key) {
            return cached.clone();
        }
        self.entities.insert(key, entity.clone());
        self.place(key, zoom);
        entity
    }

    fn insert_fetched_geometry(&mut self, entry: GeometryEntry, zoom: u8) {
        if entry.key.kind == EntityKind::Node || self.geometries.contains_key(&entry.key) {
            return;
        }
        self.geometries.insert(entry.key, entry.geometry);
        if self.entities.contains_key(&entry.key) {
            self.place(entry.key, zoom);
        }
    }

    fn evict_tile(&mut self, pos: &TilePos) {
        let Some(tile) = self.tiles.remove(pos) else {
            return;
        };
        for key in tile.keys {
            if let Some(placed) = self.placements.get_mut(&key) {
                placed.remove(pos);
                if placed.is_empty() {
                    self.placements.remove(&key);
                    self.indexed_nodes.remove(&key);
                    self.entities.remove(&key);
                    self.geometries.remove(&key);
                }
            }
        }
    }

    /// Drop entries not held by any tile. Loose entries inside a pinned area
    /// may not be in storage yet and are kept.
    fn prune_loose(&mut self, zoom: u8) -> usize {
        let loose: Vec<EntityKey> = self
            .entities
            .keys()
            .chain(self.geometries.keys())
            .filter(|k| !self.placements.contains_key(*k))
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|k| {
                !self
                    .bounds_of(k)
                    .is_some_and(|b| self.touches_pin(&TilesRect::covering(&b, zoom)))
            })
            .collect();
        for key in &loose {
            self.indexed_nodes.remove(key);
            self.entities.remove(key);
            self.geometries.remove(key);
        }
        loose.len()
    }

    /// LRU-evict unpinned tiles until at most `target` remain.
    fn trim_to(&mut self, target: usize) -> usize {
        if self.tiles.len() <= target {
            return 0;
        }
        let mut candidates: Vec<(u64, u64, TilePos)> = self
            .tiles
            .iter()
            .filter(|(pos, _)| !self.is_pinned(pos))
            .map(|(pos, tile)| (tile.last_access, tile.inserted, *pos))
            .collect();
        candidates.sort_unstable();

        let excess = self.tiles.len() - target;
        let mut evicted = 0;
        for (_, _, pos) in candidates.into_iter().take(excess) {
            self.evict_tile(&pos);
            evicted += 1;
        }
        evicted
    }

    /// Entities and geometries placed in the tiles of `rect` whose bounds
    /// intersect `bbox`.
    fn collect_in(&self, rect: &TilesRect, bbox: &BoundingBox) -> (MapData, Vec<EntityKey>) {
        let mut data = MapData::with_bbox(*bbox);
        let mut seen: HashSet<EntityKey> = HashSet::new();
        for pos in self.loaded_tiles_in(rect) {
            let Some(tile) = self.tiles.get(&pos) else {
                continue;
            };
            for key in &tile.keys {
                if !seen.insert(*key) {
                    continue;
                }
                let inside = self.bounds_of(key).is_some_and(|b| b.intersects(bbox));
                if !inside {
                    continue;
                }
                if let Some(entity) = self.entities.get(key) {
                    data.insert(entity.clone());
                }
            }
        }
        let keys = data.keys().copied().collect();
        (data, keys)
    }
}

/// Tile-indexed read-through cache of map data
pub struct SpatialCache {
    state: Mutex<CacheState>,
    storage: StoragePorts,
    config: CacheConfig,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for SpatialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SpatialCache {
    /// Create a cache with default configuration
    pub fn new(storage: StoragePorts) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            storage,
            config: CacheConfig::default(),
            metrics: CacheMetrics::new(),
        }
    }

    /// Create a cache with custom configuration
    pub fn with_config(config: CacheConfig, storage: StoragePorts) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(CacheState::default()),
            storage,
            config,
            metrics: CacheMetrics::new(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn zoom(&self) -> u8 {
        self.config.tile_zoom
    }

    // =========================================================================
    // Identity lookups
    // =========================================================================

    pub fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.get_entities(std::slice::from_ref(key))?.pop())
    }

    /// Entities for `keys`, fetching misses from storage. Keys unknown to
    /// storage are omitted.
    pub fn get_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        let zoom = self.zoom();
        let mut state = self.state.lock();

        let mut result = Vec::with_capacity(keys.len());
        let mut misses = Vec::new();
        let mut touched = HashSet::new();
        for key in keys {
            match state.entities.get(key) {
                Some(entity) => {
                    result.push(entity.clone());
                    if let Some(placed) = state.placements.get(key) {
                        touched.extend(placed.iter().copied());
                    }
                }
                None => misses.push(*key),
            }
        }
        self.metrics.record_hits(result.len() as u64);
        state.touch(&touched);

        if !misses.is_empty() {
            self.metrics.record_misses(misses.len() as u64);
            trace!(misses = misses.len(), "Fetching entities from storage");
            for entity in self.storage.get_entities(&misses)? {
                result.push(state.insert_fetched(entity, zoom));
            }
        }
        Ok(result)
    }

    pub fn get_nodes(&self, ids: &[i64]) -> Result<Vec<Node>> {
        let keys: Vec<EntityKey> = ids.iter().map(|id| EntityKey::node(*id)).collect();
        Ok(self
            .get_entities(&keys)?
            .into_iter()
            .filter_map(|e| match e {
                Entity::Node(n) => Some(n),
                _ => None,
            })
            .collect())
    }

    pub fn get_ways(&self, ids: &[i64]) -> Result<Vec<Way>> {
        let keys: Vec<EntityKey> = ids.iter().map(|id| EntityKey::way(*id)).collect();
        Ok(self
            .get_entities(&keys)?
            .into_iter()
            .filter_map(|e| match e {
                Entity::Way(w) => Some(w),
                _ => None,
            })
            .collect())
    }

    pub fn get_relations(&self, ids: &[i64]) -> Result<Vec<Relation>> {
        let keys: Vec<EntityKey> = ids.iter().map(|id| EntityKey::relation(*id)).collect();
        Ok(self
            .get_entities(&keys)?
            .into_iter()
            .filter_map(|e| match e {
                Entity::Relation(r) => Some(r),
                _ => None,
            })
            .collect())
    }

    pub fn get_geometry(&self, key: &EntityKey) -> Result<Option<Geometry>> {
        Ok(self
            .get_geometries(std::slice::from_ref(key))?
            .pop()
            .map(|entry| entry.geometry))
    }

    /// Geometries for `keys`. Node geometries are derived from the node
    /// position, fetching the node itself on a miss.
    pub fn get_geometries(&self, keys: &[EntityKey]) -> Result<Vec<GeometryEntry>> {
        let zoom = self.zoom();
        let mut state = self.state.lock();

        let mut result = Vec::with_capacity(keys.len());
        let mut missing_nodes = Vec::new();
        let mut missing_shapes = Vec::new();
        for key in keys {
            match state.geometry_of(key) {
                Some(geometry) => result.push(GeometryEntry::new(*key, geometry)),
                None if key.kind == EntityKind::Node => missing_nodes.push(key.id),
                None => missing_shapes.push(*key),
            }
        }
        self.metrics.record_hits(result.len() as u64);
        let misses = missing_nodes.len() + missing_shapes.len();
        if misses == 0 {
            return Ok(result);
        }
        self.metrics.record_misses(misses as u64);

        if !missing_nodes.is_empty() {
            for node in self.storage.nodes.get_all(&missing_nodes)? {
                let key = EntityKey::node(node.id);
                let position = node.position;
                state.insert_fetched(Entity::Node(node), zoom);
                result.push(GeometryEntry::new(key, Geometry::Point(position)));
            }
        }
        if !missing_shapes.is_empty() {
            for entry in self.storage.geometries.get_all(&missing_shapes)? {
                result.push(entry.clone());
                state.insert_fetched_geometry(entry, zoom);
            }
        }
        Ok(result)
    }

    // =========================================================================
    // Spatial lookups
    // =========================================================================

    /// Everything in `bbox`, loading any uncovered tiles from storage first.
    pub fn get_map_data_in_bbox(&self, bbox: &BoundingBox) -> Result<MapDataWithGeometry> {
        let zoom = self.zoom();
        let rect = TilesRect::covering(bbox, zoom);

        if rect.size() > self.config.max_tiles {
            // would thrash the whole cache; serve straight from storage
            debug!(tiles = rect.size(), %bbox, "Bounding box exceeds cache capacity");
            self.metrics.record_misses(1);
            return self.read_region_uncached(bbox);
        }

        let mut state = self.state.lock();
        let uncovered: Vec<TilePos> = rect
            .tiles()
            .filter(|t| !state.tiles.contains_key(t))
            .collect();

        if uncovered.is_empty() {
            self.metrics.record_hits(1);
        } else {
            self.metrics.record_misses(1);
            self.load_tiles(&mut state, &uncovered)?;
        }

        let all: Vec<TilePos> = rect.tiles().collect();
        state.touch(&all);

        let (data, keys) = state.collect_in(&rect, bbox);
        let mut geometries = Vec::with_capacity(keys.len());
        let mut stale = Vec::new();
        for key in keys {
            match state.geometry_of(&key) {
                Some(geometry) => geometries.push(GeometryEntry::new(key, geometry)),
                None => stale.push(key),
            }
        }
        if !stale.is_empty() {
            // geometry invalidated by a node change; storage is the fallback
            for entry in self.storage.geometries.get_all(&stale)? {
                geometries.push(entry.clone());
                state.insert_fetched_geometry(entry, zoom);
            }
        }

        if !uncovered.is_empty() {
            self.auto_trim(&mut state);
        }
        Ok(MapDataWithGeometry::new(data, geometries))
    }

    /// Fetch the area enclosing `uncovered` and populate those tiles.
    fn load_tiles(&self, state: &mut CacheState, uncovered: &[TilePos]) -> Result<()> {
        let zoom = self.zoom();
        let Some(fetch_rect) = TilesRect::enclosing(uncovered) else {
            return Ok(());
        };
        let fetch_bbox = fetch_rect.bbox(zoom);
        debug!(tiles = uncovered.len(), bbox = %fetch_bbox, "Loading tiles from storage");
        let region = self.storage.get_region(&fetch_bbox)?;
        self.metrics.record_tile_fetch(uncovered.len() as u64);

        for pos in uncovered {
            state.load_tile(*pos);
        }
        for (key, geometry) in region.geometries {
            state.insert_fetched_geometry(GeometryEntry::new(key, geometry), zoom);
        }
        // nodes, then ways, then relations
        let mut fetched: Vec<Entity> = region.data.into_entities().collect();
        fetched.sort_unstable_by_key(Entity::key);
        for entity in fetched {
            state.insert_fetched(entity, zoom);
        }

        // cached values whose writes are still queued are missing from the
        // region; every cached entity touching the new tiles gets placed
        let cached: Vec<EntityKey> = state
            .entities
            .keys()
            .filter(|k| state.bounds_of(k).is_some_and(|b| b.intersects(&fetch_bbox)))
            .copied()
            .collect();
        for key in cached {
            state.place(key, zoom);
        }
        Ok(())
    }

    fn read_region_uncached(&self, bbox: &BoundingBox) -> Result<MapDataWithGeometry> {
        let region = self.storage.get_region(bbox)?;
        let geometries = region.geometries;
        let mut data = MapData::with_bbox(*bbox);
        let mut entries = Vec::new();
        for entity in region.data.into_entities() {
            let key = entity.key();
            let Some(geometry) = geometries.get(&key) else {
                continue;
            };
            let inside = geometry.bounds().is_some_and(|b| b.intersects(bbox));
            if inside {
                entries.push(GeometryEntry::new(key, geometry.clone()));
                data.insert(entity);
            }
        }
        Ok(MapDataWithGeometry::new(data, entries))
    }

    /// Keys of cached entities in loaded tiles whose bounds intersect `bbox`.
    pub fn keys_in_bbox(&self, bbox: &BoundingBox) -> Vec<EntityKey> {
        let rect = TilesRect::covering(bbox, self.zoom());
        let state = self.state.lock();
        state.collect_in(&rect, bbox).1
    }

    /// Ways referencing the node. Answered from the tile index when the
    /// node's tile is loaded.
    pub fn get_ways_for_node(&self, node_id: i64) -> Result<Vec<Way>> {
        let zoom = self.zoom();
        let mut state = self.state.lock();

        let node_tile = state
            .entities
            .get(&EntityKey::node(node_id))
            .and_then(Entity::as_node)
            .map(|n| TilePos::containing(&n.position, zoom))
            .filter(|pos| state.tiles.contains_key(pos));

        if let Some(pos) = node_tile {
            let ways: Vec<Way> = state.tiles[&pos]
                .node_refs
                .get(&node_id)
                .into_iter()
                .flatten()
                .filter(|k| k.kind == EntityKind::Way)
                .filter_map(|k| state.entities.get(k))
                .filter_map(|e| e.as_way().cloned())
                .collect();
            state.touch([&pos]);
            self.metrics.record_hits(1);
            return Ok(ways);
        }

        self.metrics.record_misses(1);
        let ways = self.storage.ways.get_all_for_node(node_id)?;
        Ok(ways
            .into_iter()
            .filter_map(|w| state.insert_fetched(Entity::Way(w), zoom).as_way().cloned())
            .collect())
    }

    /// Relations having `key` as a member, read through storage.
    pub fn get_relations_for_entity(&self, key: &EntityKey) -> Result<Vec<Relation>> {
        let zoom = self.zoom();
        let mut state = self.state.lock();
        let relations = self.storage.relations.get_all_for_entity(key)?;
        self.metrics.record_misses(1);
        Ok(relations
            .into_iter()
            .filter_map(|r| {
                state
                    .insert_fetched(Entity::Relation(r), zoom)
                    .as_relation()
                    .cloned()
            })
            // a cached copy may have dropped the membership already
            .filter(|r| r.members.iter().any(|m| m.key() == *key))
            .collect())
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Merge a diff.
    ///
    /// With `coverage`, every tile fully inside it is created if absent and
    /// from then on served without a storage fetch. `deleted` keys are
    /// removed from every tile regardless.
    pub fn update(
        &self,
        deleted: &[EntityKey],
        updated: &[Entity],
        geometries: &[GeometryEntry],
        coverage: Option<&BoundingBox>,
    ) {
        let zoom = self.zoom();
        let mut state = self.state.lock();
        let mut touched: HashSet<TilePos> = HashSet::new();
        let mut loaded = 0;

        match coverage.and_then(|c| TilesRect::enclosed(c, zoom)) {
            Some(rect) if rect.size() > self.config.max_tiles => {
                // would not fit; the area stays unknown and reads go to storage
                debug!(tiles = rect.size(), "Coverage exceeds cache capacity");
            }
            Some(rect) => {
                for pos in rect.tiles() {
                    if state.load_tile(pos) {
                        loaded += 1;
                    }
                    touched.insert(pos);
                }
            }
            None => {}
        }

        for key in deleted {
            if let Some(placed) = state.placements.get(key) {
                touched.extend(placed.iter().copied());
            }
            state.remove_entity(key);
            if key.kind == EntityKind::Node {
                for tile in state.tiles.values_mut() {
                    tile.node_refs.remove(&key.id);
                }
            }
        }

        let fresh: HashMap<EntityKey, &Geometry> =
            geometries.iter().map(|e| (e.key, &e.geometry)).collect();

        // geometries of ways/relations using a changed node are stale
        let mut invalidated = 0;
        for node in updated.iter().filter_map(Entity::as_node) {
            let referrers: Vec<EntityKey> = state
                .tiles
                .values()
                .filter_map(|t| t.node_refs.get(&node.id))
                .flatten()
                .copied()
                .filter(|k| !fresh.contains_key(k))
                .collect();
            for key in referrers {
                if state.geometries.remove(&key).is_some() {
                    invalidated += 1;
                }
            }
        }
        if invalidated > 0 {
            self.metrics.record_geometry_invalidations(invalidated);
        }

        for entity in updated {
            let key = entity.key();
            if let Some(placed) = state.placements.get(&key) {
                touched.extend(placed.iter().copied());
            }
            state.unplace(&key);
            state.entities.insert(key, entity.clone());
            match fresh.get(&key) {
                Some(geometry) if key.kind != EntityKind::Node => {
                    state.geometries.insert(key, (*geometry).clone());
                }
                _ => {
                    state.geometries.remove(&key);
                }
            }
        }
        // placed once all values are in, so relations index their member ways
        for entity in updated {
            let key = entity.key();
            state.place(key, zoom);
            if let Some(placed) = state.placements.get(&key) {
                touched.extend(placed.iter().copied());
            }
        }

        // geometries for entities not part of this update
        let updated_keys: HashSet<EntityKey> = updated.iter().map(Entity::key).collect();
        for entry in geometries {
            if entry.key.kind == EntityKind::Node || updated_keys.contains(&entry.key) {
                continue;
            }
            state.unplace(&entry.key);
            state.geometries.insert(entry.key, entry.geometry.clone());
            if state.entities.contains_key(&entry.key) {
                state.place(entry.key, zoom);
            }
        }

        state.touch(&touched);
        debug!(
            deleted = deleted.len(),
            updated = updated.len(),
            geometries = geometries.len(),
            tiles_loaded = loaded,
            "Cache updated"
        );
        if loaded > 0 {
            self.auto_trim(&mut state);
        }
    }

    // =========================================================================
    // Pinning and eviction
    // =========================================================================

    /// Pin every tile covering `bbox` against eviction.
    pub fn no_trim_plus(&self, bbox: &BoundingBox) {
        let rect = TilesRect::covering(bbox, self.zoom());
        let mut state = self.state.lock();
        if rect.size() > self.config.max_tiles {
            state.wide_pins.push(rect);
            return;
        }
        for pos in rect.tiles() {
            *state.pins.entry(pos).or_insert(0) += 1;
        }
    }

    /// Release one pin on every tile covering `bbox`. Tiles held above
    /// capacity by the pin are trimmed once it is gone.
    pub fn no_trim_minus(&self, bbox: &BoundingBox) {
        let rect = TilesRect::covering(bbox, self.zoom());
        let mut state = self.state.lock();
        if rect.size() > self.config.max_tiles {
            match state.wide_pins.iter().position(|w| *w == rect) {
                Some(index) => {
                    state.wide_pins.swap_remove(index);
                }
                None => warn!(tiles = rect.size(), "Unbalanced no_trim_minus"),
            }
        } else {
            for pos in rect.tiles() {
                match state.pins.get_mut(&pos) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        state.pins.remove(&pos);
                    }
                    None => warn!(tile = %pos, "Unbalanced no_trim_minus"),
                }
            }
        }
        if state.tiles.len() > self.config.max_tiles {
            self.auto_trim(&mut state);
        }
    }

    /// Pin `bbox` until the returned guard is dropped.
    pub fn pin(&self, bbox: &BoundingBox) -> TilePin<'_> {
        self.no_trim_plus(bbox);
        TilePin {
            cache: self,
            bbox: *bbox,
        }
    }

    /// Pin count of a tile.
    pub fn pin_count(&self, pos: &TilePos) -> usize {
        self.state.lock().pin_count(pos)
    }

    /// Evict least recently used unpinned tiles until at most `target`
    /// remain, then drop entries no tile holds any more.
    pub fn trim(&self, target: usize) {
        let mut state = self.state.lock();
        let evicted = state.trim_to(target);
        let pruned = state.prune_loose(self.zoom());
        self.metrics.record_evictions(evicted as u64);
        debug!(evicted, pruned, remaining = state.tiles.len(), "Cache trimmed");
    }

    fn auto_trim(&self, state: &mut CacheState) {
        let evicted = state.trim_to(self.config.max_tiles);
        if evicted > 0 {
            state.prune_loose(self.zoom());
            self.metrics.record_evictions(evicted as u64);
            debug!(evicted, remaining = state.tiles.len(), "Cache over capacity");
        }
    }

    /// Drop all tiles, values and indices. Pins are operation bookkeeping
    /// and survive, so in-flight operations stay balanced.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let pins = std::mem::take(&mut state.pins);
        let wide_pins = std::mem::take(&mut state.wide_pins);
        *state = CacheState {
            pins,
            wide_pins,
            ..Default::default()
        };
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn tile_count(&self) -> usize {
        self.state.lock().tiles.len()
    }

    pub fn is_tile_loaded(&self, pos: &TilePos) -> bool {
        self.state.lock().tiles.contains_key(pos)
    }

    /// Loaded tiles, in no particular order.
    pub fn loaded_tiles(&self) -> Vec<TilePos> {
        self.state.lock().tiles.keys().copied().collect()
    }

    /// Cached entity without touching storage or recency.
    pub fn peek(&self, key: &EntityKey) -> Option<Entity> {
        self.state.lock().entities.get(key).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let pinned_tiles = state
            .tiles
            .keys()
            .filter(|pos| state.is_pinned(pos))
            .count();
        CacheStats {
            tiles: state.tiles.len(),
            pinned_tiles,
            entities: state.entities.len(),
            geometries: state.geometries.len(),
            hits: self.metrics.hits(),
            misses: self.metrics.misses(),
            hit_ratio: self.metrics.hit_ratio(),
            tile_fetches: self.metrics.tile_fetches(),
            tiles_evicted: self.metrics.tiles_evicted(),
            geometry_invalidations: self.metrics.geometry_invalidations(),
        }
    }
}

/// Scoped pin from [`SpatialCache::pin`]
#[derive(Debug)]
pub struct TilePin<'a> {
    cache: &'a SpatialCache,
    bbox: BoundingBox,
}

impl Drop for TilePin<'_> {
    fn drop(&mut self) {
        self.cache.no_trim_minus(&self.bbox);
    }
}

impl EntitySource for SpatialCache {
    fn fetch_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        self.get_entities(keys)
    }
}

// =============================================================================
// Tests
// =============================================================================
