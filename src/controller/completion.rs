//! Graph Completion
//!
//! Augments a batch with the dependents geometry creation needs: member
//! ways and nodes of relations, then the nodes of every way. Dependents are
//! read from local sources only and resolved one level deep; member
//! relations are never fetched.

use std::collections::BTreeSet;

use tracing::debug;

use crate::domain::{EntityKey, EntityKind, EntitySource, MapData};
use crate::error::Result;

/// What a completion pass fetched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionStats {
    /// Dependents requested from the source
    pub requested: usize,
    /// Dependents the source returned
    pub fetched: usize,
}

impl CompletionStats {
    /// Dependents the source did not know about
    pub fn missing(&self) -> usize {
        self.requested - self.fetched
    }
}

/// Fill `batch` with its missing dependents from `source`.
///
/// Dependents absent from `source` stay absent.
pub fn complete(batch: &mut MapData, source: &dyn EntitySource) -> Result<CompletionStats> {
    let mut stats = CompletionStats::default();

    // relation members first, so their ways contribute node ids below
    let members: BTreeSet<EntityKey> = batch
        .relations()
        .flat_map(|r| r.members.iter())
        .filter(|m| m.kind != EntityKind::Relation)
        .map(|m| m.key())
        .filter(|k| !batch.contains(k))
        .collect();
    fetch_into(batch, source, members, &mut stats)?;

    let nodes: BTreeSet<EntityKey> = batch
        .ways()
        .flat_map(|w| w.node_ids.iter())
        .map(|id| EntityKey::node(*id))
        .filter(|k| !batch.contains(k))
        .collect();
    fetch_into(batch, source, nodes, &mut stats)?;

    if stats.requested > 0 {
        debug!(
            requested = stats.requested,
            fetched = stats.fetched,
            "Completed batch dependents"
        );
    }
    Ok(stats)
}

fn fetch_into(
    batch: &mut MapData,
    source: &dyn EntitySource,
    keys: BTreeSet<EntityKey>,
    stats: &mut CompletionStats,
) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let keys: Vec<EntityKey> = keys.into_iter().collect();
    let fetched = source.fetch_entities(&keys)?;
    stats.requested += keys.len();
    stats.fetched += fetched.len();
    batch.extend(fetched);
    Ok(())
}
