//! Backend Adapters
//!
//! Implementations of the backend query and entity-reference ports:
//! - InMemory: in-process store for dry runs and tests
//! - Crd: CnsVolumeMetadata objects in a Kubernetes namespace

pub mod crd;
pub mod memory;

pub use crd::*;
pub use memory::*;

use crate::domain::ports::{Cursor, EntityReference, QueryFilter, QueryResult, VolumeRecord};
use std::collections::BTreeMap;

fn matches_filter(volume_id: &str, references: &[EntityReference], filter: &QueryFilter) -> bool {
    let volume_ok = filter.volume_ids.is_empty() || filter.volume_ids.iter().any(|id| id == volume_id);
    let cluster_ok = filter.cluster_ids.is_empty()
        || references.iter().any(|reference| {
            reference
                .cluster_id()
                .map_or(false, |cluster| filter.cluster_ids.iter().any(|id| id == cluster))
        });
    volume_ok && cluster_ok
}

/// Apply a query filter and its offset/limit cursor to a snapshot of
/// backend volumes keyed by volume id.
pub(crate) fn paginate(
    volumes: BTreeMap<String, Vec<EntityReference>>,
    filter: &QueryFilter,
) -> QueryResult {
    let matched: Vec<VolumeRecord> = volumes
        .into_iter()
        .filter(|(volume_id, references)| matches_filter(volume_id, references, filter))
        .map(|(volume_id, entity_references)| VolumeRecord {
            volume_id,
            entity_references,
        })
        .collect();

    let total = matched.len() as u64;
    let offset = filter.cursor.offset.min(total);
    let page: Vec<VolumeRecord> = matched
        .into_iter()
        .skip(offset as usize)
        .take(filter.cursor.limit as usize)
        .collect();

    QueryResult {
        cursor: Cursor {
            offset: offset + page.len() as u64,
            limit: filter.cursor.limit,
            total_records: total,
        },
        volumes: page,
    }
}
