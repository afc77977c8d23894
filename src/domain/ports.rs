//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the abstractions the cache and controller depend on.
//! Storage engines, geometry math, entity tracking and UI listeners live
//! outside the crate core and plug in through these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Controller + Spatial Cache                  │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  NodeRepository │ WayRepository │ RelationRepository │    │
//! │  │  GeometryRepository │ GeometryCreator │ Listener     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                              │
//! │  InMemoryMapStore │ SimpleGeometryCreator │ LoggingListener  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage ports are blocking: the durable store is expected to be a local
//! database, and the persistence queue runs writes on the blocking pool.

use crate::error::Result;

use super::geo::{BoundingBox, Geometry};
use super::model::{
    Entity, EntityKey, GeometryEntry, MapData, MapDataWithGeometry, Node, Relation, Way,
};

// =============================================================================
// Storage Ports
// =============================================================================

/// Durable storage of nodes.
pub trait NodeRepository: Send + Sync {
    fn get(&self, id: i64) -> Result<Option<Node>>;

    /// Nodes for the given ids; unknown ids are skipped.
    fn get_all(&self, ids: &[i64]) -> Result<Vec<Node>>;

    fn get_all_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<Node>>;

    fn ids_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<i64>>;

    fn put_all(&self, nodes: &[Node]) -> Result<()>;

    /// Returns the number of nodes actually deleted.
    fn delete_all(&self, ids: &[i64]) -> Result<usize>;

    /// Ids last written before `timestamp` (epoch millis), oldest first.
    fn ids_older_than(&self, timestamp: i64, limit: Option<usize>) -> Result<Vec<i64>>;

    /// The subset of `ids` not referenced by any stored way.
    fn filter_ids_without_ways(&self, ids: &[i64]) -> Result<Vec<i64>>;

    fn clear(&self) -> Result<()>;
}

/// Durable storage of ways.
pub trait WayRepository: Send + Sync {
    fn get(&self, id: i64) -> Result<Option<Way>>;

    fn get_all(&self, ids: &[i64]) -> Result<Vec<Way>>;

    /// Ways whose node list contains `node_id`.
    fn get_all_for_node(&self, node_id: i64) -> Result<Vec<Way>>;

    fn put_all(&self, ways: &[Way]) -> Result<()>;

    fn delete_all(&self, ids: &[i64]) -> Result<usize>;

    fn ids_older_than(&self, timestamp: i64, limit: Option<usize>) -> Result<Vec<i64>>;

    fn clear(&self) -> Result<()>;
}

/// Durable storage of relations.
pub trait RelationRepository: Send + Sync {
    fn get(&self, id: i64) -> Result<Option<Relation>>;

    fn get_all(&self, ids: &[i64]) -> Result<Vec<Relation>>;

    /// Relations having `key` as a member.
    fn get_all_for_entity(&self, key: &EntityKey) -> Result<Vec<Relation>>;

    fn put_all(&self, relations: &[Relation]) -> Result<()>;

    fn delete_all(&self, ids: &[i64]) -> Result<usize>;

    fn ids_older_than(&self, timestamp: i64, limit: Option<usize>) -> Result<Vec<i64>>;

    fn clear(&self) -> Result<()>;
}

/// Durable storage of way and relation geometries.
///
/// Node geometries are never stored; they derive from node positions.
pub trait GeometryRepository: Send + Sync {
    fn get(&self, key: &EntityKey) -> Result<Option<Geometry>>;

    fn get_all(&self, keys: &[EntityKey]) -> Result<Vec<GeometryEntry>>;

    /// Entries whose bounds intersect `bbox`.
    fn get_all_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<GeometryEntry>>;

    fn keys_in_bbox(&self, bbox: &BoundingBox) -> Result<Vec<EntityKey>>;

    fn put_all(&self, entries: &[GeometryEntry]) -> Result<()>;

    fn delete_all(&self, keys: &[EntityKey]) -> Result<usize>;

    fn clear(&self) -> Result<()>;
}

/// Local source of entities by key.
///
/// Implemented by the storage facade and by the spatial cache (as a
/// read-through), so graph completion never needs the network.
pub trait EntitySource: Send + Sync {
    /// Entities for the given keys; unknown keys are skipped.
    fn fetch_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>>;
}

// =============================================================================
// Geometry Port
// =============================================================================

/// Computes the shape of an entity.
pub trait GeometryCreator: Send + Sync {
    /// Build a geometry for `entity`, resolving references through `context`.
    ///
    /// Returns `None` when required dependents are missing. With
    /// `allow_incomplete`, relations are built from whatever members resolve.
    fn create(&self, entity: &Entity, context: &MapData, allow_incomplete: bool)
        -> Option<Geometry>;
}

// =============================================================================
// Collaborator Ports
// =============================================================================

/// Keeps track of entities created locally and confirmed remotely.
pub trait CreatedElementsTracker: Send + Sync {
    fn track_created(&self, keys: &[EntityKey]);

    fn untrack(&self, keys: &[EntityKey]);

    fn clear(&self);
}

/// Observability hook raised while durable writes are outstanding.
pub trait PersistenceSignal: Send + Sync {
    fn set_persisting(&self, persisting: bool);
}

/// Receives change notifications synchronously on the notifying thread.
pub trait MapDataListener: Send + Sync {
    /// Entities were updated and/or deleted.
    fn on_updated(&self, updated: &MapDataWithGeometry, deleted: &[EntityKey]);

    /// Everything inside `bbox` was replaced by `data`.
    fn on_replaced_for_bbox(&self, bbox: &BoundingBox, data: &MapDataWithGeometry);

    /// All map data was dropped.
    fn on_cleared(&self);
}
