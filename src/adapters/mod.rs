//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  Node/Way/Relation/GeometryRepository │ GeometryCreator    │ │
//! │  │  MapDataListener │ CreatedElementsTracker │ Signal         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryMapStore │ SimpleGeometryCreator                    │ │
//! │  │ LoggingListener │ RecordingListener                         │ │
//! │  │ InMemoryCreatedElementsTracker │ FlagPersistenceSignal      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use mapsync::adapters::InMemoryMapStore;
//! use mapsync::domain::StoragePorts;
//!
//! let store = Arc::new(InMemoryMapStore::new());
//! let ports = StoragePorts::from_store(store.clone());
//! ```

mod geometry;
mod in_memory;
mod listener;
mod tracker;

pub use geometry::SimpleGeometryCreator;
pub use in_memory::{InMemoryMapStore, StoreStats};
pub use listener::{LoggingListener, RecordingListener};
pub use tracker::{FlagPersistenceSignal, InMemoryCreatedElementsTracker};
