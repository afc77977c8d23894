//! Domain Layer
//!
//! Entities, geographic value objects, the ports the core depends on, and
//! the storage facade over those ports.
//!
//! # Architecture
//!
//! - **Model** (`model.rs`) - Nodes, ways, relations and their batches
//! - **Geo** (`geo.rs`) - Positions, bounding boxes, geometries
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Storage** (`storage.rs`) - Facade bundling the repository ports
//! - **Events** (`events.rs`) - Serializable notification summaries
//!
//! # Usage
//!
//! ```ignore
//! use mapsync::domain::{BoundingBox, EntityKey, StoragePorts};
//!
//! let ports = StoragePorts::from_store(store);
//! let keys = ports.keys_in_bbox(&BoundingBox::new(0.0, 0.0, 0.1, 0.1))?;
//! ```

pub mod events;
pub mod geo;
pub mod model;
pub mod ports;
pub mod storage;

pub use events::MapDataEvent;
pub use geo::{BoundingBox, Geometry, LatLon};
pub use model::{
    Entity, EntityKey, EntityKind, GeometryEntry, IdUpdate, MapData, MapDataUpdates,
    MapDataWithGeometry, Node, Relation, RelationMember, Tags, Way,
};
pub use ports::{
    CreatedElementsTracker, EntitySource, GeometryCreator, GeometryRepository, MapDataListener,
    NodeRepository, PersistenceSignal, RelationRepository, WayRepository,
};
pub use storage::StoragePorts;
