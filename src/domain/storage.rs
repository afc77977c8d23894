//! Storage Facade
//!
//! Bundles the per-kind repositories and offers the key-based batch helpers
//! shared by the spatial cache and the controller.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;

use super::geo::{BoundingBox, Geometry};
use super::model::{Entity, EntityKey, EntityKind, GeometryEntry, MapData, MapDataWithGeometry};
use super::ports::{
    EntitySource, GeometryRepository, NodeRepository, RelationRepository, WayRepository,
};

/// Handles to every storage port.
#[derive(Clone)]
pub struct StoragePorts {
    pub nodes: Arc<dyn NodeRepository>,
    pub ways: Arc<dyn WayRepository>,
    pub relations: Arc<dyn RelationRepository>,
    pub geometries: Arc<dyn GeometryRepository>,
}

impl std::fmt::Debug for StoragePorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePorts").finish_non_exhaustive()
    }
}

/// Entity keys grouped by kind.
#[derive(Debug, Default)]
pub(crate) struct KeysByKind {
    pub nodes: Vec<i64>,
    pub ways: Vec<i64>,
    pub relations: Vec<i64>,
}

impl KeysByKind {
    pub fn split<'a>(keys: impl IntoIterator<Item = &'a EntityKey>) -> Self {
        let mut split = Self::default();
        for key in keys {
            match key.kind {
                EntityKind::Node => split.nodes.push(key.id),
                EntityKind::Way => split.ways.push(key.id),
                EntityKind::Relation => split.relations.push(key.id),
            }
        }
        split
    }
}

impl StoragePorts {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        ways: Arc<dyn WayRepository>,
        relations: Arc<dyn RelationRepository>,
        geometries: Arc<dyn GeometryRepository>,
    ) -> Self {
        Self {
            nodes,
            ways,
            relations,
            geometries,
        }
    }

    /// Use one store implementing every repository.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: NodeRepository + WayRepository + RelationRepository + GeometryRepository + 'static,
    {
        Self {
            nodes: store.clone(),
            ways: store.clone(),
            relations: store.clone(),
            geometries: store,
        }
    }

    pub fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(match key.kind {
            EntityKind::Node => self.nodes.get(key.id)?.map(Entity::Node),
            EntityKind::Way => self.ways.get(key.id)?.map(Entity::Way),
            EntityKind::Relation => self.relations.get(key.id)?.map(Entity::Relation),
        })
    }

    pub fn get_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        let split = KeysByKind::split(keys);
        let mut entities = Vec::with_capacity(keys.len());
        if !split.nodes.is_empty() {
            entities.extend(self.nodes.get_all(&split.nodes)?.into_iter().map(Entity::Node));
        }
        if !split.ways.is_empty() {
            entities.extend(self.ways.get_all(&split.ways)?.into_iter().map(Entity::Way));
        }
        if !split.relations.is_empty() {
            entities.extend(
                self.relations
                    .get_all(&split.relations)?
                    .into_iter()
                    .map(Entity::Relation),
            );
        }
        Ok(entities)
    }

    /// Geometries for the given keys. Node geometries come from positions.
    pub fn get_geometries(&self, keys: &[EntityKey]) -> Result<Vec<GeometryEntry>> {
        let (node_keys, other_keys): (Vec<EntityKey>, Vec<EntityKey>) =
            keys.iter().copied().partition(|k| k.kind == EntityKind::Node);

        let mut entries = Vec::with_capacity(keys.len());
        if !node_keys.is_empty() {
            let ids: Vec<i64> = node_keys.iter().map(|k| k.id).collect();
            entries.extend(self.nodes.get_all(&ids)?.into_iter().map(|n| {
                GeometryEntry::new(EntityKey::node(n.id), Geometry::Point(n.position))
            }));
        }
        if !other_keys.is_empty() {
            entries.extend(self.geometries.get_all(&other_keys)?);
        }
        Ok(entries)
    }

    /// Keys of every stored entity inside `bbox`.
    pub fn keys_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<EntityKey>> {
        let mut keys: Vec<EntityKey> = self
            .nodes
            .ids_in_bbox(bbox)?
            .into_iter()
            .map(EntityKey::node)
            .collect();
        keys.extend(self.geometries.keys_in_bbox(bbox)?);
        Ok(keys)
    }

    /// Everything stored in `bbox`: nodes inside it, ways and relations whose
    /// geometry intersects it, plus the nodes of those ways.
    pub fn get_region(&self, bbox: &BoundingBox) -> Result<MapDataWithGeometry> {
        let nodes = self.nodes.get_all_in_bbox(bbox)?;
        let entries = self.geometries.get_all_in_bbox(bbox)?;

        let split = KeysByKind::split(entries.iter().map(|e| &e.key));
        let ways = self.ways.get_all(&split.ways)?;
        let relations = self.relations.get_all(&split.relations)?;

        let mut data = MapData::with_bbox(*bbox);
        let mut geometries: Vec<GeometryEntry> = entries;
        for node in nodes {
            geometries.push(GeometryEntry::new(
                EntityKey::node(node.id),
                Geometry::Point(node.position),
            ));
            data.insert(Entity::Node(node));
        }

        let missing: HashSet<i64> = ways
            .iter()
            .flat_map(|w| w.node_ids.iter().copied())
            .filter(|id| data.node(*id).is_none())
            .collect();
        if !missing.is_empty() {
            let ids: Vec<i64> = missing.into_iter().collect();
            for node in self.nodes.get_all(&ids)? {
                geometries.push(GeometryEntry::new(
                    EntityKey::node(node.id),
                    Geometry::Point(node.position),
                ));
                data.insert(Entity::Node(node));
            }
        }

        data.extend(ways.into_iter().map(Entity::Way));
        data.extend(relations.into_iter().map(Entity::Relation));
        Ok(MapDataWithGeometry::new(data, geometries))
    }

    /// Upsert entities of any kind.
    pub fn put_entities<'a>(&self, entities: impl IntoIterator<Item = &'a Entity>) -> Result<()> {
        let mut nodes = Vec::new();
        let mut ways = Vec::new();
        let mut relations = Vec::new();
        for entity in entities {
            match entity {
                Entity::Node(n) => nodes.push(n.clone()),
                Entity::Way(w) => ways.push(w.clone()),
                Entity::Relation(r) => relations.push(r.clone()),
            }
        }
        if !nodes.is_empty() {
            self.nodes.put_all(&nodes)?;
        }
        if !ways.is_empty() {
            self.ways.put_all(&ways)?;
        }
        if !relations.is_empty() {
            self.relations.put_all(&relations)?;
        }
        Ok(())
    }

    /// Upsert geometries; node entries are skipped.
    pub fn put_geometries(&self, entries: &[GeometryEntry]) -> Result<()> {
        let stored: Vec<GeometryEntry> = entries
            .iter()
            .filter(|e| e.key.kind != EntityKind::Node)
            .cloned()
            .collect();
        if stored.is_empty() {
            return Ok(());
        }
        self.geometries.put_all(&stored)
    }

    /// Delete entities and their geometries. Returns the number of entities
    /// deleted.
    pub fn delete_entities(&self, keys: &[EntityKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let split = KeysByKind::split(keys);
        let mut deleted = 0;
        if !split.relations.is_empty() {
            deleted += self.relations.delete_all(&split.relations)?;
        }
        if !split.ways.is_empty() {
            deleted += self.ways.delete_all(&split.ways)?;
        }
        if !split.nodes.is_empty() {
            deleted += self.nodes.delete_all(&split.nodes)?;
        }
        let geometry_keys: Vec<EntityKey> = keys
            .iter()
            .filter(|k| k.kind != EntityKind::Node)
            .copied()
            .collect();
        if !geometry_keys.is_empty() {
            self.geometries.delete_all(&geometry_keys)?;
        }
        Ok(deleted)
    }

    /// Drop every kind of stored data.
    pub fn clear_all(&self) -> Result<()> {
        self.relations.clear()?;
        self.ways.clear()?;
        self.nodes.clear()?;
        self.geometries.clear()
    }
}

impl EntitySource for StoragePorts {
    fn fetch_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        self.get_entities(keys)
    }
}
