//! Tile Addressing
//!
//! Web Mercator (slippy map) tiles at a fixed zoom level. Tiles are the
//! addressing and eviction unit of the spatial cache.

use std::f64::consts::PI;

use crate::domain::{BoundingBox, LatLon};

/// Web Mercator valid latitude range
pub const MAX_LAT: f64 = 85.051_128_78;
pub const MIN_LAT: f64 = -MAX_LAT;

/// Highest supported zoom level
pub const MAX_ZOOM: u8 = 20;

/// Tile position at a given zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TilePos {
    /// X coordinate (east-west), 0 at west
    pub x: u32,
    /// Y coordinate (north-south), 0 at north
    pub y: u32,
}

impl TilePos {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Tile containing `pos` at `zoom`. Positions beyond the Mercator range
    /// are clamped to the edge tiles.
    pub fn containing(pos: &LatLon, zoom: u8) -> Self {
        let n = 2.0_f64.powi(zoom as i32);
        let max_index = n as u32 - 1;

        let lon = pos.lon.clamp(-180.0, 180.0);
        let x = ((lon + 180.0) / 360.0 * n).floor() as u32;

        let lat_rad = pos.lat.clamp(MIN_LAT, MAX_LAT) * PI / 180.0;
        let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor() as u32;

        Self {
            x: x.min(max_index),
            y: y.min(max_index),
        }
    }

    /// Geographic area of this tile.
    pub fn bbox(&self, zoom: u8) -> BoundingBox {
        let n = 2.0_f64.powi(zoom as i32);
        let min_lon = self.x as f64 / n * 360.0 - 180.0;
        let max_lon = (self.x + 1) as f64 / n * 360.0 - 180.0;
        let max_lat = tile_y_to_lat(self.y as f64, n);
        let min_lat = tile_y_to_lat((self.y + 1) as f64, n);
        BoundingBox::new(min_lat, min_lon, max_lat, max_lon)
    }
}

impl std::fmt::Display for TilePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.x, self.y)
    }
}

fn tile_y_to_lat(y: f64, n: f64) -> f64 {
    let lat_rad = (PI * (1.0 - 2.0 * y / n)).sinh().atan();
    lat_rad * 180.0 / PI
}

/// Inclusive rectangle of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilesRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl TilesRect {
    /// Tiles covering `bbox` at `zoom`.
    pub fn covering(bbox: &BoundingBox, zoom: u8) -> Self {
        // north-west corner has the smallest tile indices
        let top_left = TilePos::containing(&LatLon::new(bbox.max.lat, bbox.min.lon), zoom);
        let bottom_right = TilePos::containing(&LatLon::new(bbox.min.lat, bbox.max.lon), zoom);
        Self {
            left: top_left.x,
            top: top_left.y,
            right: bottom_right.x,
            bottom: bottom_right.y,
        }
    }

    /// Tiles lying completely inside `bbox` at `zoom`, if there are any.
    pub fn enclosed(bbox: &BoundingBox, zoom: u8) -> Option<Self> {
        let mut rect = Self::covering(bbox, zoom);
        let area = |x, y| TilePos::new(x, y).bbox(zoom);

        // only the border rows and columns can stick out
        if area(rect.left, rect.top).min.lon < bbox.min.lon {
            rect.left += 1;
        }
        if area(rect.right, rect.top).max.lon > bbox.max.lon {
            rect.right = rect.right.checked_sub(1)?;
        }
        if area(rect.left, rect.top).max.lat > bbox.max.lat {
            rect.top += 1;
        }
        if area(rect.left, rect.bottom).min.lat < bbox.min.lat {
            rect.bottom = rect.bottom.checked_sub(1)?;
        }
        (rect.left <= rect.right && rect.top <= rect.bottom).then_some(rect)
    }

    /// Smallest rectangle enclosing all `tiles`.
    pub fn enclosing<'a>(tiles: impl IntoIterator<Item = &'a TilePos>) -> Option<Self> {
        let mut iter = tiles.into_iter();
        let first = iter.next()?;
        let mut rect = Self {
            left: first.x,
            top: first.y,
            right: first.x,
            bottom: first.y,
        };
        for t in iter {
            rect.left = rect.left.min(t.x);
            rect.top = rect.top.min(t.y);
            rect.right = rect.right.max(t.x);
            rect.bottom = rect.bottom.max(t.y);
        }
        Some(rect)
    }

    pub fn size(&self) -> usize {
        ((self.right - self.left + 1) as usize) * ((self.bottom - self.top + 1) as usize)
    }

    pub fn contains(&self, tile: &TilePos) -> bool {
        tile.x >= self.left && tile.x <= self.right && tile.y >= self.top && tile.y <= self.bottom
    }

    pub fn intersects(&self, other: &TilesRect) -> bool {
        self.left <= other.right
            && other.left <= self.right
            && self.top <= other.bottom
            && other.top <= self.bottom
    }

    /// Row-major iteration over every tile.
    pub fn tiles(&self) -> impl Iterator<Item = TilePos> + '_ {
        (self.top..=self.bottom)
            .flat_map(move |y| (self.left..=self.right).map(move |x| TilePos::new(x, y)))
    }

    /// Geographic area of the whole rectangle.
    pub fn bbox(&self, zoom: u8) -> BoundingBox {
        let top_left = TilePos::new(self.left, self.top).bbox(zoom);
        let bottom_right = TilePos::new(self.right, self.bottom).bbox(zoom);
        top_left.union(&bottom_right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_york_city_at_zoom_16() {
        let tile = TilePos::containing(&LatLon::new(40.7128, -74.0060), 16);
        assert_eq!(tile, TilePos::new(19295, 24640));
    }

    #[test]
    fn test_tile_bbox_contains_source_position() {
        let pos = LatLon::new(53.5511, 9.9937);
        let tile = TilePos::containing(&pos, 16);
        assert!(tile.bbox(16).contains(&pos));
    }

    #[test]
    fn test_edges_are_clamped() {
        let north = TilePos::containing(&LatLon::new(90.0, 180.0), 2);
        assert_eq!(north, TilePos::new(3, 0));
        let south = TilePos::containing(&LatLon::new(-90.0, -180.0), 2);
        assert_eq!(south, TilePos::new(0, 3));
    }

    #[test]
    fn test_rect_covering_and_iteration() {
        let center = TilePos::new(10, 20).bbox(8).center();
        let inner = BoundingBox::new(center.lat, center.lon, center.lat, center.lon);
        let rect = TilesRect::covering(&inner, 8);
        assert_eq!(rect.size(), 1);
        assert!(rect.contains(&TilePos::new(10, 20)));

        let rect = TilesRect {
            left: 1,
            top: 1,
            right: 2,
            bottom: 2,
        };
        let tiles: Vec<TilePos> = rect.tiles().collect();
        assert_eq!(
            tiles,
            vec![
                TilePos::new(1, 1),
                TilePos::new(2, 1),
                TilePos::new(1, 2),
                TilePos::new(2, 2)
            ]
        );
        assert_eq!(rect.size(), 4);
    }

    #[test]
    fn test_rect_intersects() {
        let rect = |left, top, right, bottom| TilesRect {
            left,
            top,
            right,
            bottom,
        };
        assert!(rect(0, 0, 2, 2).intersects(&rect(2, 2, 4, 4)));
        assert!(rect(0, 0, 9, 9).intersects(&rect(3, 3, 4, 4)));
        assert!(!rect(0, 0, 2, 2).intersects(&rect(3, 0, 4, 2)));
        assert!(!rect(0, 0, 2, 2).intersects(&rect(0, 3, 2, 4)));
    }

    #[test]
    fn test_enclosed_rect() {
        let tile = TilePos::new(300, 400);
        let area = tile.bbox(12);
        let rect = TilesRect::enclosed(&area, 12).unwrap();
        assert_eq!(rect.size(), 1);
        assert!(rect.contains(&tile));

        let shrunk = BoundingBox::new(
            area.min.lat + 0.001,
            area.min.lon + 0.001,
            area.max.lat - 0.001,
            area.max.lon - 0.001,
        );
        assert_eq!(TilesRect::enclosed(&shrunk, 12), None);
    }

    #[test]
    fn test_enclosing_rect() {
        let tiles = [TilePos::new(5, 9), TilePos::new(3, 12), TilePos::new(4, 10)];
        let rect = TilesRect::enclosing(&tiles).unwrap();
        assert_eq!(
            rect,
            TilesRect {
                left: 3,
                top: 9,
                right: 5,
                bottom: 12
            }
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: every position lies inside the tile computed for it.
        #[test]
        fn prop_position_inside_its_tile(
            lat in -85.0f64..85.0,
            lon in -179.99f64..179.99,
            zoom in 1u8..=18,
        ) {
            let pos = LatLon::new(lat, lon);
            let tile = TilePos::containing(&pos, zoom);
            let bbox = tile.bbox(zoom);
            prop_assert!(bbox.min.lat - 1e-9 <= lat && lat <= bbox.max.lat + 1e-9);
            prop_assert!(bbox.min.lon - 1e-9 <= lon && lon <= bbox.max.lon + 1e-9);
        }

        /// Property: the covering rectangle contains the tile of every corner.
        #[test]
        fn prop_covering_contains_corners(
            lat in -80.0f64..79.0,
            lon in -179.0f64..178.0,
            dlat in 0.0f64..1.0,
            dlon in 0.0f64..1.0,
        ) {
            let bbox = BoundingBox::new(lat, lon, lat + dlat, lon + dlon);
            let rect = TilesRect::covering(&bbox, 14);
            for corner in [bbox.min, bbox.max, LatLon::new(bbox.min.lat, bbox.max.lon)] {
                prop_assert!(rect.contains(&TilePos::containing(&corner, 14)));
            }
        }

        /// Property: the enclosed rectangle holds exactly the covering tiles
        /// that lie completely inside the box.
        #[test]
        fn prop_enclosed_matches_tile_areas(
            lat in -80.0f64..79.0,
            lon in -179.0f64..178.0,
            dlat in 0.0f64..0.5,
            dlon in 0.0f64..0.5,
        ) {
            let bbox = BoundingBox::new(lat, lon, lat + dlat, lon + dlon);
            let enclosed = TilesRect::enclosed(&bbox, 12);
            for tile in TilesRect::covering(&bbox, 12).tiles() {
                let area = tile.bbox(12);
                let inside = bbox.contains(&area.min) && bbox.contains(&area.max);
                let listed = enclosed.is_some_and(|r| r.contains(&tile));
                prop_assert_eq!(inside, listed);
            }
        }
    }
}
