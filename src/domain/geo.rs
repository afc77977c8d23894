//! Geographic Value Objects
//!
//! Positions, bounding boxes and precomputed entity shapes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Latitude/longitude pair in degrees (value object).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Check the position lies on the globe.
    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lon) {
            return Err(Error::InvalidCoordinate {
                lat: self.lat,
                lon: self.lon,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for LatLon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.7}, {:.7})", self.lat, self.lon)
    }
}

/// Min/max latitude-longitude rectangle.
///
/// Used both for queries and for describing the area a batch of map data
/// fully covers. Edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: LatLon,
    pub max: LatLon,
}

impl BoundingBox {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min: LatLon::new(min_lat, min_lon),
            max: LatLon::new(max_lat, max_lon),
        }
    }

    /// Create a bounding box, rejecting inverted or off-globe corners.
    pub fn try_new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Result<Self> {
        let bbox = Self::new(min_lat, min_lon, max_lat, max_lon);
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<()> {
        self.min.validate()?;
        self.max.validate()?;
        if self.min.lat > self.max.lat || self.min.lon > self.max.lon {
            return Err(Error::InvalidBoundingBox {
                reason: format!("min {} is not below max {}", self.min, self.max),
            });
        }
        Ok(())
    }

    /// Smallest box enclosing all positions, `None` for an empty input.
    pub fn enclosing<'a>(positions: impl IntoIterator<Item = &'a LatLon>) -> Option<Self> {
        let mut iter = positions.into_iter();
        let first = iter.next()?;
        let mut bbox = Self {
            min: *first,
            max: *first,
        };
        for p in iter {
            bbox.min.lat = bbox.min.lat.min(p.lat);
            bbox.min.lon = bbox.min.lon.min(p.lon);
            bbox.max.lat = bbox.max.lat.max(p.lat);
            bbox.max.lon = bbox.max.lon.max(p.lon);
        }
        Some(bbox)
    }

    pub fn contains(&self, p: &LatLon) -> bool {
        p.lat >= self.min.lat
            && p.lat <= self.max.lat
            && p.lon >= self.min.lon
            && p.lon <= self.max.lon
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min.lat <= other.max.lat
            && other.min.lat <= self.max.lat
            && self.min.lon <= other.max.lon
            && other.min.lon <= self.max.lon
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min.lat.min(other.min.lat),
            self.min.lon.min(other.min.lon),
            self.max.lat.max(other.max.lat),
            self.max.lon.max(other.max.lon),
        )
    }

    pub fn center(&self) -> LatLon {
        LatLon::new(
            (self.min.lat + self.max.lat) / 2.0,
            (self.min.lon + self.max.lon) / 2.0,
        )
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} - {}]", self.min, self.max)
    }
}

/// Precomputed shape of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(LatLon),
    Polylines(Vec<Vec<LatLon>>),
    Polygons(Vec<Vec<LatLon>>),
}

impl Geometry {
    /// Bounds of every vertex; a point has a zero-area box.
    pub fn bounds(&self) -> Option<BoundingBox> {
        match self {
            Geometry::Point(p) => BoundingBox::enclosing([p]),
            Geometry::Polylines(rings) | Geometry::Polygons(rings) => {
                BoundingBox::enclosing(rings.iter().flatten())
            }
        }
    }

    /// Center of the bounds, used for labelling and quest placement.
    pub fn center(&self) -> Option<LatLon> {
        match self {
            Geometry::Point(p) => Some(*p),
            _ => self.bounds().map(|b| b.center()),
        }
    }
}
