//! Metadata Syncer - the synchronization engine
//!
//! Drives two kinds of work against the backend:
//! - Full sync: periodic reconciliation of every driver-owned volume,
//!   pushing only the difference between cluster and backend state
//! - Incremental sync: watch callbacks queue object keys, workers process
//!   each key on its own and retry failures with backoff
//!
//! Both paths only read the object cache and push idempotent upserts and
//! deletes, so they may run concurrently; the last writer wins.

use super::annotations::has_migrated_to_annotation;
use super::config::SyncerConfig;
use super::entity::{
    claim_names, diff, expected_for_volumes, expected_references, pod_is_active, pod_reference,
    pv_reference, pvc_reference,
};
use super::filter::{
    volume_id, volumes_in_bound_available_or_released, DriverIdentity, VolumePhase, SYNCED_PHASES,
};
use super::keys::{object_key, split_key};
use super::metrics::SyncMetrics;
use super::pagination::query_all;
use super::queue::WorkQueue;
use super::validity::{is_valid_volume, resolve_claim, VolumeValidity};
use crate::domain::ports::{
    EntityKind, EntityRefId, EntityReference, EntityReferenceStoreRef, ObjectCacheRef,
    ResourceEventHandler, VolumeQueryClientRef, WatchEvent,
};
use crate::error::{Error, ErrorAction, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::Resource;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Work Items
// =============================================================================

/// Queue key: object kind plus `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub kind: EntityKind,
    pub key: String,
}

impl WorkItem {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

/// How much to push when syncing a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncScope {
    /// Only the object's own reference
    Object,
    /// Every reference of the volume the object belongs to
    Volume,
}

/// Work accumulated for a key until a worker picks it up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWork {
    pub remove: Vec<EntityRefId>,
    pub sync: Option<SyncScope>,
}

impl PendingWork {
    pub fn sync(scope: SyncScope) -> Self {
        Self {
            remove: Vec::new(),
            sync: Some(scope),
        }
    }

    pub fn remove(ids: Vec<EntityRefId>) -> Self {
        Self {
            remove: ids,
            sync: None,
        }
    }

    /// Fold later work into this one. A later removal without a sync
    /// cancels any earlier sync since the object is gone.
    pub fn merge(&mut self, later: PendingWork) {
        let removes_object = !later.remove.is_empty() && later.sync.is_none();
        for id in later.remove {
            if !self.remove.contains(&id) {
                self.remove.push(id);
            }
        }
        self.sync = if removes_object {
            None
        } else {
            self.sync.max(later.sync)
        };
    }
}

/// Outcome of a full sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    /// Another pass was running, nothing was done
    pub skipped: bool,
    /// Driver-owned volumes considered
    pub volumes: usize,
    pub upserts: usize,
    pub deletes: usize,
    /// Backend pushes that failed and are left to the next pass
    pub failed: usize,
}

// =============================================================================
// Metadata Syncer
// =============================================================================

/// Keeps backend entity references in sync with cluster state
pub struct MetadataSyncer {
    config: SyncerConfig,
    identity: DriverIdentity,
    cache: ObjectCacheRef,
    query: VolumeQueryClientRef,
    store: EntityReferenceStoreRef,
    queue: Arc<WorkQueue<WorkItem>>,
    pending: DashMap<WorkItem, PendingWork>,
    full_sync_lock: tokio::sync::Mutex<()>,
    metrics: SyncMetrics,
}

impl MetadataSyncer {
    /// Create a new syncer
    pub fn new(
        config: SyncerConfig,
        cache: ObjectCacheRef,
        query: VolumeQueryClientRef,
        store: EntityReferenceStoreRef,
        metrics: SyncMetrics,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let identity = DriverIdentity::new(config.driver_name.clone(), config.csi_migration);
        let queue = WorkQueue::new(config.retry_initial_delay(), config.retry_max_delay());

        Ok(Arc::new(Self {
            config,
            identity,
            cache,
            query,
            store,
            queue,
            pending: DashMap::new(),
            full_sync_lock: tokio::sync::Mutex::new(()),
            metrics,
        }))
    }

    /// Driver identity; its migration switch may be flipped at runtime
    pub fn identity(&self) -> &DriverIdentity {
        &self.identity
    }

    pub fn queue(&self) -> &Arc<WorkQueue<WorkItem>> {
        &self.queue
    }

    fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    /// Run workers and the periodic full sync until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            driver = %self.identity.name(),
            workers = self.config.workers,
            interval_secs = self.config.full_sync_interval_secs,
            "Starting metadata syncer"
        );

        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let syncer = Arc::clone(&self);
            let cancel = shutdown.child_token();
            workers.push(tokio::spawn(async move {
                while syncer.process_next(&cancel).await {}
                debug!(worker_id, "Worker stopped");
            }));
        }

        let mut ticker = tokio::time::interval(self.config.full_sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let pass = shutdown.child_token();
                    if let Err(e) = self.full_sync(&pass).await {
                        warn!("FullSync failed, retrying next interval: {}", e);
                    }
                }
            }
        }

        self.queue.shut_down();
        for worker in workers {
            let _ = worker.await;
        }
        info!("Metadata syncer stopped");
    }

    // =========================================================================
    // Full Sync
    // =========================================================================

    /// Run one full sync pass. Skipped if another pass is still running.
    pub async fn full_sync(&self, cancel: &CancellationToken) -> Result<FullSyncReport> {
        let Ok(_guard) = self.full_sync_lock.try_lock() else {
            info!("FullSync: previous pass still running, skipping");
            self.metrics.full_sync_runs.with_label_values(&["skipped"]).inc();
            return Ok(FullSyncReport {
                skipped: true,
                ..Default::default()
            });
        };

        let started = Instant::now();
        let result = self.full_sync_pass(cancel).await;
        self.metrics
            .full_sync_duration
            .observe(started.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(report) if report.failed == 0 => "success",
            _ => "failure",
        };
        self.metrics.full_sync_runs.with_label_values(&[outcome]).inc();
        result
    }

    async fn full_sync_pass(&self, cancel: &CancellationToken) -> Result<FullSyncReport> {
        info!("FullSync: start");
        let cache = self.cache.as_ref();

        let pvs = volumes_in_bound_available_or_released(cache, &self.identity)?;
        let expected = expected_for_volumes(cache, &pvs, self.cluster_id())?;

        let pages = query_all(
            self.query.as_ref(),
            &[],
            self.config.cluster_scope(),
            self.config.query_page_limit,
            cancel,
        )
        .await?;
        let actual = pages
            .into_iter()
            .flat_map(|page| page.volumes)
            .flat_map(|volume| volume.entity_references);

        let delta = diff(expected, actual, self.cluster_id());
        let mut report = FullSyncReport {
            volumes: pvs.len(),
            ..Default::default()
        };

        for reference in &delta.upserts {
            match self.push_upsert(reference, cancel).await {
                Ok(()) => report.upserts += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(id = %reference.id(), "FullSync: failed to upsert entity reference: {}", e);
                    report.failed += 1;
                }
            }
        }
        for id in &delta.deletes {
            match self.push_delete(id, cancel).await {
                Ok(()) => report.deletes += 1,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(id = %id, "FullSync: failed to delete entity reference: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            volumes = report.volumes,
            upserts = report.upserts,
            deletes = report.deletes,
            failed = report.failed,
            "FullSync: end"
        );
        Ok(report)
    }

    // =========================================================================
    // Backend Pushes
    // =========================================================================

    // Cancelling abandons the call in flight; a later pass or retry repeats it.

    async fn push_upsert(
        &self,
        reference: &EntityReference,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.store.upsert(reference) => result,
        };
        self.metrics.record_operation("upsert", result.is_ok());
        result
    }

    async fn push_delete(&self, id: &EntityRefId, cancel: &CancellationToken) -> Result<()> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.store.delete(id) => result,
        };
        self.metrics.record_operation("delete", result.is_ok());
        result
    }

    async fn push_all(
        &self,
        references: &[EntityReference],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for reference in references {
            self.push_upsert(reference, cancel).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Incremental Sync
    // =========================================================================

    fn enqueue(&self, item: WorkItem, work: PendingWork) {
        match self.pending.entry(item.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(work),
            Entry::Vacant(slot) => {
                slot.insert(work);
            }
        }
        self.queue.add(item);
        self.metrics.queue_depth.set(self.queue.len() as i64);
    }

    /// Put failed work back, underneath anything queued since
    fn restore(&self, item: WorkItem, failed: PendingWork) {
        match self.pending.entry(item) {
            Entry::Occupied(mut existing) => {
                let newer = std::mem::take(existing.get_mut());
                let mut restored = failed;
                restored.merge(newer);
                *existing.get_mut() = restored;
            }
            Entry::Vacant(slot) => {
                slot.insert(failed);
            }
        }
    }

    /// Process one queued key. Returns false once the queue has shut down.
    /// Firing `cancel` aborts the backend call in progress and requeues the key.
    pub async fn process_next(&self, cancel: &CancellationToken) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };
        let work = self
            .pending
            .remove(&item)
            .map(|(_, work)| work)
            .unwrap_or_default();

        match self.process(&item, &work, cancel).await {
            Ok(()) => self.queue.forget(&item),
            Err(e) => match e.action() {
                ErrorAction::RequeueWithBackoff => {
                    warn!(kind = %item.kind, key = %item.key, "Sync failed, retrying with backoff: {}", e);
                    self.restore(item.clone(), work);
                    self.queue.add_rate_limited(item.clone());
                }
                ErrorAction::RequeueAfter(delay) => {
                    warn!(kind = %item.kind, key = %item.key, ?delay, "Sync failed, retrying later: {}", e);
                    self.restore(item.clone(), work);
                    self.queue.add_after(item.clone(), delay);
                }
                ErrorAction::NoRequeue => {
                    warn!(kind = %item.kind, key = %item.key, "Sync failed, dropping: {}", e);
                    self.queue.forget(&item);
                }
            },
        }

        self.queue.done(&item);
        self.metrics.queue_depth.set(self.queue.len() as i64);
        true
    }

    async fn process(
        &self,
        item: &WorkItem,
        work: &PendingWork,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for id in &work.remove {
            self.push_delete(id, cancel).await?;
        }
        let Some(scope) = work.sync else {
            return Ok(());
        };
        match item.kind {
            EntityKind::PersistentVolume => self.sync_pv(&item.key, scope, cancel).await,
            EntityKind::PersistentVolumeClaim => self.sync_pvc(&item.key, scope, cancel).await,
            EntityKind::Pod => self.sync_pod(&item.key, cancel).await,
        }
    }

    async fn sync_pv(&self, key: &str, scope: SyncScope, cancel: &CancellationToken) -> Result<()> {
        let pv = match self.cache.get_pv(key) {
            Ok(pv) => pv,
            Err(Error::Lookup { .. }) => {
                debug!(pv = key, "PV no longer cached, nothing to sync");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self.identity.owns(&pv) {
            debug!(pv = key, "PV is not owned by this driver");
            return Ok(());
        }
        if !VolumePhase::of(&pv).map_or(false, |phase| SYNCED_PHASES.contains(&phase)) {
            debug!(pv = key, "PV phase is not synced");
            return Ok(());
        }

        let references = match scope {
            SyncScope::Object => pv_reference(&pv, self.cluster_id()).into_iter().collect(),
            SyncScope::Volume => expected_references(self.cache.as_ref(), &pv, self.cluster_id())?,
        };
        self.push_all(&references, cancel).await
    }

    async fn sync_pvc(
        &self,
        key: &str,
        scope: SyncScope,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (Some(namespace), name) = split_key(key) else {
            return Err(Error::KeyResolution(format!("claim key {} has no namespace", key)));
        };

        let (pv, pvc) = match resolve_claim(self.cache.as_ref(), &self.identity, namespace, name) {
            VolumeValidity::Valid { pv, pvc } => (pv, pvc),
            VolumeValidity::Invalid(reason) => {
                debug!(pvc = key, ?reason, "Claim is not a valid driver volume");
                return Ok(());
            }
        };
        if VolumePhase::of(&pv) != Some(VolumePhase::Bound) {
            debug!(pvc = key, "Volume is not bound yet");
            return Ok(());
        }

        let references = match scope {
            SyncScope::Object => volume_id(&pv)
                .and_then(|volume_id| pvc_reference(&pvc, volume_id, self.cluster_id()))
                .into_iter()
                .collect(),
            SyncScope::Volume => expected_references(self.cache.as_ref(), &pv, self.cluster_id())?,
        };
        self.push_all(&references, cancel).await
    }

    async fn sync_pod(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let (Some(namespace), name) = split_key(key) else {
            return Err(Error::KeyResolution(format!("pod key {} has no namespace", key)));
        };
        let pod = match self.cache.get_pod(namespace, name) {
            Ok(pod) => pod,
            Err(Error::Lookup { .. }) => {
                debug!(pod = key, "Pod no longer cached, nothing to sync");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !pod_is_active(&pod) {
            return Ok(());
        }

        let references = self.pod_references(&pod);
        self.push_all(&references, cancel).await
    }

    /// References for every valid driver volume a Pod mounts
    fn pod_references(&self, pod: &Pod) -> Vec<EntityReference> {
        let volumes = pod
            .spec
            .iter()
            .flat_map(|spec| spec.volumes.iter().flatten())
            .filter(|volume| volume.persistent_volume_claim.is_some());

        let mut references = Vec::new();
        for volume in volumes {
            let Some((pv, _pvc)) =
                is_valid_volume(self.cache.as_ref(), &self.identity, pod, volume).into_resolved()
            else {
                continue;
            };
            if let Some(volume_id) = volume_id(&pv) {
                references.extend(pod_reference(pod, volume_id, self.cluster_id()));
            }
        }
        references
    }

    // =========================================================================
    // Event Helpers
    // =========================================================================

    fn resolve_key<K: Resource>(&self, kind: EntityKind, event: &WatchEvent<K>) -> Option<String> {
        match object_key(event) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(%kind, "Dropping watch event: {}", e);
                self.metrics
                    .dropped_events
                    .with_label_values(&[&kind.to_string()])
                    .inc();
                None
            }
        }
    }

    fn update_key<K: Resource>(&self, kind: EntityKind, obj: &Arc<K>) -> Option<String> {
        self.resolve_key(kind, &WatchEvent::Live(Arc::clone(obj)))
    }
}

fn claim_is_bound(pvc: &PersistentVolumeClaim) -> bool {
    let phase = pvc.status.as_ref().and_then(|status| status.phase.as_deref());
    let volume_name = pvc.spec.as_ref().and_then(|spec| spec.volume_name.as_deref());
    phase == Some("Bound") && volume_name.map_or(false, |name| !name.is_empty())
}

fn bound_volume_name(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec.as_ref().and_then(|spec| spec.volume_name.as_deref())
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|status| status.phase.as_deref())
}

// =============================================================================
// Watch Callbacks
// =============================================================================

impl ResourceEventHandler<PersistentVolume> for MetadataSyncer {
    fn on_add(&self, event: WatchEvent<PersistentVolume>) {
        if let Some(key) = self.resolve_key(EntityKind::PersistentVolume, &event) {
            self.enqueue(
                WorkItem::new(EntityKind::PersistentVolume, key),
                PendingWork::sync(SyncScope::Object),
            );
        }
    }

    fn on_update(&self, old: &Arc<PersistentVolume>, new: &Arc<PersistentVolume>) {
        let migrated = has_migrated_to_annotation(
            old.metadata.annotations.as_ref(),
            new.metadata.annotations.as_ref(),
        );
        let changed = old.metadata.labels != new.metadata.labels
            || VolumePhase::of(old) != VolumePhase::of(new);
        if !migrated && !changed {
            return;
        }

        if let Some(key) = self.update_key(EntityKind::PersistentVolume, new) {
            let scope = if migrated {
                info!(pv = %key, "PV migrated to CSI, seeding volume references");
                SyncScope::Volume
            } else {
                SyncScope::Object
            };
            self.enqueue(
                WorkItem::new(EntityKind::PersistentVolume, key),
                PendingWork::sync(scope),
            );
        }
    }

    fn on_delete(&self, event: WatchEvent<PersistentVolume>) {
        let Some(key) = self.resolve_key(EntityKind::PersistentVolume, &event) else {
            return;
        };
        let Some(pv) = event.object() else {
            warn!(pv = %key, "Deleted PV has no last known state, leaving cleanup to full sync");
            return;
        };
        if !self.identity.owns(pv) {
            return;
        }

        let ids: Vec<_> = pv_reference(pv, self.cluster_id())
            .map(|reference| reference.id())
            .into_iter()
            .collect();
        self.enqueue(
            WorkItem::new(EntityKind::PersistentVolume, key),
            PendingWork::remove(ids),
        );
    }
}

impl ResourceEventHandler<PersistentVolumeClaim> for MetadataSyncer {
    fn on_add(&self, event: WatchEvent<PersistentVolumeClaim>) {
        let bound = event.object().map_or(false, |pvc| claim_is_bound(pvc));
        if !bound {
            return;
        }
        if let Some(key) = self.resolve_key(EntityKind::PersistentVolumeClaim, &event) {
            self.enqueue(
                WorkItem::new(EntityKind::PersistentVolumeClaim, key),
                PendingWork::sync(SyncScope::Object),
            );
        }
    }

    fn on_update(&self, old: &Arc<PersistentVolumeClaim>, new: &Arc<PersistentVolumeClaim>) {
        if !claim_is_bound(new) {
            return;
        }
        let migrated = has_migrated_to_annotation(
            old.metadata.annotations.as_ref(),
            new.metadata.annotations.as_ref(),
        );
        let changed = old.metadata.labels != new.metadata.labels
            || bound_volume_name(old) != bound_volume_name(new)
            || !claim_is_bound(old);
        if !migrated && !changed {
            return;
        }

        if let Some(key) = self.update_key(EntityKind::PersistentVolumeClaim, new) {
            let scope = if migrated {
                info!(pvc = %key, "PVC migrated to CSI, seeding volume references");
                SyncScope::Volume
            } else {
                SyncScope::Object
            };
            self.enqueue(
                WorkItem::new(EntityKind::PersistentVolumeClaim, key),
                PendingWork::sync(scope),
            );
        }
    }

    fn on_delete(&self, event: WatchEvent<PersistentVolumeClaim>) {
        let Some(key) = self.resolve_key(EntityKind::PersistentVolumeClaim, &event) else {
            return;
        };
        let Some(pvc) = event.object() else {
            warn!(pvc = %key, "Deleted PVC has no last known state, leaving cleanup to full sync");
            return;
        };
        let Some(volume_name) = bound_volume_name(pvc).filter(|name| !name.is_empty()) else {
            return;
        };
        let pv = match self.cache.get_pv(volume_name) {
            Ok(pv) => pv,
            Err(e) => {
                warn!(pvc = %key, "Cannot resolve volume of deleted PVC, leaving cleanup to full sync: {}", e);
                return;
            }
        };
        if !self.identity.owns(&pv) {
            return;
        }

        let ids: Vec<_> = volume_id(&pv)
            .and_then(|volume_id| pvc_reference(pvc, volume_id, self.cluster_id()))
            .map(|reference| reference.id())
            .into_iter()
            .collect();
        self.enqueue(
            WorkItem::new(EntityKind::PersistentVolumeClaim, key),
            PendingWork::remove(ids),
        );
    }
}

impl ResourceEventHandler<Pod> for MetadataSyncer {
    fn on_add(&self, event: WatchEvent<Pod>) {
        let mounts_claims = event
            .object()
            .map_or(false, |pod| claim_names(pod).next().is_some());
        if !mounts_claims {
            return;
        }
        if let Some(key) = self.resolve_key(EntityKind::Pod, &event) {
            self.enqueue(
                WorkItem::new(EntityKind::Pod, key),
                PendingWork::sync(SyncScope::Object),
            );
        }
    }

    fn on_update(&self, old: &Arc<Pod>, new: &Arc<Pod>) {
        if pod_phase(old) == pod_phase(new) || claim_names(new).next().is_none() {
            return;
        }
        let Some(key) = self.update_key(EntityKind::Pod, new) else {
            return;
        };

        let work = if pod_is_active(new) {
            PendingWork::sync(SyncScope::Object)
        } else {
            let ids = self.pod_references(new).iter().map(EntityReference::id).collect();
            PendingWork::remove(ids)
        };
        self.enqueue(WorkItem::new(EntityKind::Pod, key), work);
    }

    fn on_delete(&self, event: WatchEvent<Pod>) {
        let Some(key) = self.resolve_key(EntityKind::Pod, &event) else {
            return;
        };
        let Some(pod) = event.object() else {
            warn!(pod = %key, "Deleted Pod has no last known state, leaving cleanup to full sync");
            return;
        };

        let ids: Vec<_> = self.pod_references(pod).iter().map(EntityReference::id).collect();
        if ids.is_empty() {
            return;
        }
        self.enqueue(WorkItem::new(EntityKind::Pod, key), PendingWork::remove(ids));
    }
}

impl std::fmt::Debug for MetadataSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataSyncer")
            .field("config", &self.config)
            .field("identity", &self.identity)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}
