//! Geometry Creator Adapter
//!
//! Derives shapes from node positions: points for nodes, polylines for open
//! ways, polygons for closed ways, and the union of member way shapes for
//! relations.

use crate::domain::{Entity, EntityKind, Geometry, GeometryCreator, LatLon, MapData, Relation, Way};

/// Straightforward positional geometry builder
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleGeometryCreator;

impl SimpleGeometryCreator {
    pub fn new() -> Self {
        Self
    }

    /// Node positions of `way`, or `None` if any node is absent.
    fn way_points(way: &Way, context: &MapData) -> Option<Vec<LatLon>> {
        way.node_ids
            .iter()
            .map(|id| context.node(*id).map(|n| n.position))
            .collect()
    }

    fn way_geometry(way: &Way, context: &MapData) -> Option<Geometry> {
        let points = Self::way_points(way, context)?;
        if points.len() < 2 {
            return None;
        }
        if way.is_closed() && points.len() >= 4 {
            Some(Geometry::Polygons(vec![points]))
        } else {
            Some(Geometry::Polylines(vec![points]))
        }
    }

    fn relation_geometry(
        relation: &Relation,
        context: &MapData,
        allow_incomplete: bool,
    ) -> Option<Geometry> {
        let mut rings = Vec::new();
        let mut lines = Vec::new();
        let mut points = Vec::new();

        for member in &relation.members {
            let resolved = match member.kind {
                EntityKind::Way => context
                    .way(member.ref_id)
                    .and_then(|w| Self::way_geometry(w, context)),
                EntityKind::Node => context.node(member.ref_id).map(|n| Geometry::Point(n.position)),
                // nested relations are not resolved
                EntityKind::Relation => continue,
            };
            match resolved {
                Some(Geometry::Polygons(mut r)) => rings.append(&mut r),
                Some(Geometry::Polylines(mut l)) => lines.append(&mut l),
                Some(Geometry::Point(p)) => points.push(p),
                None if allow_incomplete => {}
                None => return None,
            }
        }

        if !rings.is_empty() && lines.is_empty() {
            Some(Geometry::Polygons(rings))
        } else if !rings.is_empty() || !lines.is_empty() {
            lines.append(&mut rings);
            Some(Geometry::Polylines(lines))
        } else if points.len() == 1 {
            Some(Geometry::Point(points[0]))
        } else if !points.is_empty() {
            Some(Geometry::Polylines(vec![points]))
        } else {
            None
        }
    }
}

impl GeometryCreator for SimpleGeometryCreator {
    fn create(&self, entity: &Entity, context: &MapData, allow_incomplete: bool) -> Option<Geometry> {
        match entity {
            Entity::Node(n) => Some(Geometry::Point(n.position)),
            Entity::Way(w) => Self::way_geometry(w, context),
            Entity::Relation(r) => Self::relation_geometry(r, context, allow_incomplete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Node, RelationMember, Tags};
    use assert_matches::assert_matches;

    fn node(id: i64, lat: f64, lon: f64) -> Entity {
        Entity::Node(Node {
            id,
            version: 1,
            tags: Tags::new(),
            position: LatLon::new(lat, lon),
            timestamp_edited: 0,
        })
    }

    fn way(id: i64, node_ids: Vec<i64>) -> Entity {
        Entity::Way(Way {
            id,
            version: 1,
            tags: Tags::new(),
            node_ids,
            timestamp_edited: 0,
        })
    }

    fn relation(id: i64, members: Vec<RelationMember>) -> Entity {
        Entity::Relation(Relation {
            id,
            version: 1,
            tags: Tags::new(),
            members,
            timestamp_edited: 0,
        })
    }

    fn square() -> MapData {
        MapData::from_entities([
            node(1, 0.0, 0.0),
            node(2, 0.0, 1.0),
            node(3, 1.0, 1.0),
            node(4, 1.0, 0.0),
            way(10, vec![1, 2, 3, 4, 1]),
            way(11, vec![1, 3]),
        ])
    }

    #[test]
    fn test_closed_way_is_polygon() {
        let data = square();
        let creator = SimpleGeometryCreator::new();
        let geometry = creator.create(data.get(&crate::domain::EntityKey::way(10)).unwrap(), &data, false);
        assert_matches!(geometry, Some(Geometry::Polygons(rings)) if rings[0].len() == 5);
    }

    #[test]
    fn test_way_with_missing_node_has_no_geometry() {
        let data = square();
        let creator = SimpleGeometryCreator::new();
        assert!(creator.create(&way(12, vec![1, 99]), &data, true).is_none());
    }

    #[test]
    fn test_relation_from_member_ways() {
        let data = square();
        let creator = SimpleGeometryCreator::new();
        let rel = relation(
            20,
            vec![
                RelationMember::new(EntityKind::Way, 11, ""),
                RelationMember::new(EntityKind::Way, 77, ""),
            ],
        );
        assert_matches!(
            creator.create(&rel, &data, true),
            Some(Geometry::Polylines(lines)) if lines.len() == 1
        );
        assert!(creator.create(&rel, &data, false).is_none());
    }
}
