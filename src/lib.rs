//! mapsync - Tile-Indexed Map Data Cache
//!
//! Keeps an in-memory, spatially indexed view of locally stored map data
//! (nodes, ways, relations and their geometries) consistent with durable
//! storage, while reads stay fast and writes never block the caller.
//!
//! # Architecture
//!
//! ```text
//! Callers → MapDataController → SpatialCache (tiles) ⇄ StoragePorts
//!                  │                                        ▲
//!                  └──────→ PersistenceSequencer ───────────┘
//! ```
//!
//! Mutations update the cache and notify listeners synchronously; the
//! durable write is queued and applied in issuance order.
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and logging implementations of the ports
//! - [`cache`] - Spatial tile cache
//! - [`controller`] - Map data controller, graph completion, listeners
//! - [`domain`] - Entities, geometry types, ports and events
//! - [`error`] - Error types
//! - [`persist`] - Ordered background persistence

pub mod adapters;
pub mod cache;
pub mod controller;
pub mod domain;
pub mod error;
pub mod persist;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheStats, SpatialCache};
pub use controller::{ControllerConfig, MapDataController};
pub use domain::{BoundingBox, Entity, EntityKey, MapData, MapDataUpdates, StoragePorts};
pub use error::{Error, Result};
pub use persist::PersistenceSequencer;
