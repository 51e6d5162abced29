//! In-memory backend
//!
//! Keeps entity references per volume in process memory. Serves the
//! `--backend memory` dry-run mode and the engine tests.

use super::paginate;
use crate::domain::ports::{
    EntityRefId, EntityReference, EntityReferenceStore, QueryFilter, QueryResult,
    VolumeQueryClient,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// In-process volume metadata store
#[derive(Debug, Default)]
pub struct InMemoryVolumeStore {
    /// volume id -> entity key -> reference
    volumes: RwLock<BTreeMap<String, BTreeMap<String, EntityReference>>>,
    upserts: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
}

impl InMemoryVolumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a volume with no entity references
    pub async fn register_volume(&self, volume_id: &str) {
        self.volumes
            .write()
            .await
            .entry(volume_id.to_string())
            .or_default();
    }

    /// Snapshot of every stored reference
    pub async fn references(&self) -> Vec<EntityReference> {
        self.volumes
            .read()
            .await
            .values()
            .flat_map(|refs| refs.values().cloned())
            .collect()
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn query_calls(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Total upsert and delete calls
    pub fn update_calls(&self) -> u64 {
        self.upsert_calls() + self.delete_calls()
    }
}

#[async_trait]
impl VolumeQueryClient for InMemoryVolumeStore {
    async fn query(&self, filter: &QueryFilter) -> Result<Option<QueryResult>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let snapshot: BTreeMap<String, Vec<EntityReference>> = self
            .volumes
            .read()
            .await
            .iter()
            .map(|(volume_id, refs)| (volume_id.clone(), refs.values().cloned().collect()))
            .collect();
        Ok(Some(paginate(snapshot, filter)))
    }
}

#[async_trait]
impl EntityReferenceStore for InMemoryVolumeStore {
    async fn upsert(&self, reference: &EntityReference) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        debug!(id = %reference.id(), kind = %reference.kind, "Upserting entity reference");
        self.volumes
            .write()
            .await
            .entry(reference.volume_id.clone())
            .or_default()
            .insert(reference.key.clone(), reference.clone());
        Ok(())
    }

    async fn delete(&self, id: &EntityRefId) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(id = %id, "Deleting entity reference");
        let mut volumes = self.volumes.write().await;
        if let Some(refs) = volumes.get_mut(&id.volume_id) {
            refs.remove(&id.key);
            if refs.is_empty() {
                volumes.remove(&id.volume_id);
            }
        }
        Ok(())
    }
}
