//! Controller module
//!
//! The map data controller and the pieces it orchestrates: graph
//! completion of incoming batches and listener notification.

pub mod completion;
mod listeners;
mod map_data;

pub use completion::{complete, CompletionStats};
pub use listeners::ListenerRegistry;
pub use map_data::MapDataController;

use crate::cache::CacheConfig;
use crate::error::Result;

/// Controller configuration
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub cache: CacheConfig,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()
    }
}
