//! Entity reference derivation and diffing
//!
//! Builds the set of entity references a volume should carry from cached
//! cluster state, and compares it with what the backend reports.

use super::filter::{volume_id, DriverIdentity, VolumePhase};
use crate::domain::ports::{
    entity_key, EntityKind, EntityRefId, EntityReference, ObjectCache, Selector,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Single References
// =============================================================================

fn reference_for<K: Resource>(
    obj: &K,
    kind: EntityKind,
    volume_id: &str,
    cluster_id: &str,
    with_labels: bool,
) -> Option<EntityReference> {
    let meta = obj.meta();
    let uid = meta.uid.as_deref().filter(|uid| !uid.is_empty())?;
    let name = meta.name.clone()?;
    let labels = if with_labels {
        meta.labels.clone().unwrap_or_default()
    } else {
        BTreeMap::new()
    };

    Some(EntityReference {
        volume_id: volume_id.to_string(),
        key: entity_key(cluster_id, uid),
        uid: uid.to_string(),
        kind,
        name,
        namespace: meta.namespace.clone(),
        labels,
    })
}

/// Reference describing the PV itself
pub fn pv_reference(pv: &PersistentVolume, cluster_id: &str) -> Option<EntityReference> {
    let volume_id = volume_id(pv)?;
    reference_for(pv, EntityKind::PersistentVolume, volume_id, cluster_id, true)
}

/// Reference describing a PVC bound to the given volume
pub fn pvc_reference(
    pvc: &PersistentVolumeClaim,
    volume_id: &str,
    cluster_id: &str,
) -> Option<EntityReference> {
    reference_for(pvc, EntityKind::PersistentVolumeClaim, volume_id, cluster_id, true)
}

/// Reference describing a Pod mounting the given volume. Pod references
/// carry no labels.
pub fn pod_reference(pod: &Pod, volume_id: &str, cluster_id: &str) -> Option<EntityReference> {
    reference_for(pod, EntityKind::Pod, volume_id, cluster_id, false)
}

// =============================================================================
// Pod Helpers
// =============================================================================

/// A Pod in a terminal phase no longer holds its volumes
pub fn pod_is_active(pod: &Pod) -> bool {
    !matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Names of the claims a Pod mounts
pub fn claim_names(pod: &Pod) -> impl Iterator<Item = &str> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|volume| volume.persistent_volume_claim.as_ref())
        .map(|claim| claim.claim_name.as_str())
}

fn mounts_claim(pod: &Pod, claim_name: &str) -> bool {
    claim_names(pod).any(|name| name == claim_name)
}

// =============================================================================
// Expected State
// =============================================================================

/// Derive the references a driver-owned PV should carry: the PV itself,
/// its bound PVC (if any) and every active Pod mounting that PVC.
///
/// A missing PVC is not an error; the PV reference is still returned.
pub fn expected_references(
    cache: &dyn ObjectCache,
    pv: &PersistentVolume,
    cluster_id: &str,
) -> Result<Vec<EntityReference>> {
    let Some(pv_ref) = pv_reference(pv, cluster_id) else {
        return Ok(Vec::new());
    };
    let volume_id = pv_ref.volume_id.clone();
    let mut references = vec![pv_ref];

    if VolumePhase::of(pv) != Some(VolumePhase::Bound) {
        return Ok(references);
    }
    let Some(claim_ref) = pv.spec.as_ref().and_then(|spec| spec.claim_ref.as_ref()) else {
        return Ok(references);
    };
    let (Some(namespace), Some(claim_name)) =
        (claim_ref.namespace.as_deref(), claim_ref.name.as_deref())
    else {
        return Ok(references);
    };

    let pvc = match cache.get_pvc(namespace, claim_name) {
        Ok(pvc) => pvc,
        Err(Error::Lookup { .. }) => {
            debug!(
                volume_id = %volume_id,
                "Claim {}/{} not cached, skipping claim references", namespace, claim_name
            );
            return Ok(references);
        }
        Err(e) => return Err(e),
    };
    references.extend(pvc_reference(&pvc, &volume_id, cluster_id));

    let pods = cache.list_pods(Some(namespace), &Selector::everything())?;
    references.extend(
        pods.iter()
            .filter(|pod| pod_is_active(pod) && mounts_claim(pod, claim_name))
            .filter_map(|pod| pod_reference(pod, &volume_id, cluster_id)),
    );

    Ok(references)
}

/// Expected references for a set of PVs
pub fn expected_for_volumes(
    cache: &dyn ObjectCache,
    pvs: &[Arc<PersistentVolume>],
    cluster_id: &str,
) -> Result<Vec<EntityReference>> {
    let mut references = Vec::new();
    for pv in pvs {
        references.extend(expected_references(cache, pv, cluster_id)?);
    }
    Ok(references)
}

// =============================================================================
// Diff
// =============================================================================

/// Changes needed to bring the backend in line with the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDiff {
    pub upserts: Vec<EntityReference>,
    pub deletes: Vec<EntityRefId>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Compare expected references with the backend's.
///
/// Backend references belonging to other clusters are left alone.
pub fn diff(
    expected: impl IntoIterator<Item = EntityReference>,
    actual: impl IntoIterator<Item = EntityReference>,
    cluster_id: &str,
) -> EntityDiff {
    let expected: BTreeMap<EntityRefId, EntityReference> =
        expected.into_iter().map(|r| (r.id(), r)).collect();
    let actual: BTreeMap<EntityRefId, EntityReference> = actual
        .into_iter()
        .filter(|r| r.cluster_id() == Some(cluster_id))
        .map(|r| (r.id(), r))
        .collect();

    let upserts = expected
        .iter()
        .filter(|(id, reference)| actual.get(*id) != Some(*reference))
        .map(|(_, reference)| reference.clone())
        .collect();

    let expected_ids: BTreeSet<&EntityRefId> = expected.keys().collect();
    let deletes = actual
        .keys()
        .filter(|id| !expected_ids.contains(id))
        .cloned()
        .collect();

    EntityDiff { upserts, deletes }
}
