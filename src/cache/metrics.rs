//! Cache Metrics Collection
//!
//! Counters for monitoring how well the spatial cache absorbs reads.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    /// Bounding-box fetches issued to storage for uncovered tiles
    tile_fetches: AtomicU64,
    tiles_loaded: AtomicU64,
    tiles_evicted: AtomicU64,
    /// Way/relation geometries dropped because a referenced node changed
    geometry_invalidations: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hits(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_misses(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_tile_fetch(&self, tiles: u64) {
        self.tile_fetches.fetch_add(1, Ordering::Relaxed);
        self.tiles_loaded.fetch_add(tiles, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.tiles_evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_geometry_invalidations(&self, n: u64) {
        self.geometry_invalidations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn tile_fetches(&self) -> u64 {
        self.tile_fetches.load(Ordering::Relaxed)
    }

    pub fn tiles_loaded(&self) -> u64 {
        self.tiles_loaded.load(Ordering::Relaxed)
    }

    pub fn tiles_evicted(&self) -> u64 {
        self.tiles_evicted.load(Ordering::Relaxed)
    }

    pub fn geometry_invalidations(&self) -> u64 {
        self.geometry_invalidations.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Loaded tiles
    pub tiles: usize,
    /// Tiles with a pin count above zero
    pub pinned_tiles: usize,
    /// Cached entities (spatial and loose)
    pub entities: usize,
    /// Cached way/relation geometries
    pub geometries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    pub tile_fetches: u64,
    pub tiles_evicted: u64,
    pub geometry_invalidations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_hits(3);
        metrics.record_misses(1);
        assert_eq!(metrics.hit_ratio(), 0.75);
    }

    #[test]
    fn test_tile_fetch_counts_tiles() {
        let metrics = CacheMetrics::new();
        metrics.record_tile_fetch(4);
        metrics.record_tile_fetch(2);
        assert_eq!(metrics.tile_fetches(), 2);
        assert_eq!(metrics.tiles_loaded(), 6);
    }
}
