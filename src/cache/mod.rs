//! Spatial Cache
//!
//! In-memory, tile-indexed view of the persisted map data.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SpatialCache                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐   │
//! │  │ Tiles (LRU)  │  │  Entities    │  │  Geometries  │   │
//! │  │ keys, refs   │─▶│  by key      │  │  way/rel     │   │
//! │  └──────────────┘  └──────────────┘  └──────────────┘   │
//! │          │ miss                                          │
//! │          ▼                                               │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │          StoragePorts (read-through)              │   │
//! │  └──────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Tiles are Web Mercator tiles at a fixed zoom (16 by default). A loaded
//! tile is complete: every stored entity whose bounds touch it is cached.

pub mod metrics;
pub mod spatial;
pub mod tile;

pub use metrics::{CacheMetrics, CacheStats};
pub use spatial::{CacheConfig, SpatialCache, TilePin};
pub use tile::{TilePos, TilesRect};

/// Default tile zoom level
pub const DEFAULT_TILE_ZOOM: u8 = 16;

/// Default number of tiles kept after a trim
pub const DEFAULT_MAX_TILES: usize = 128;
