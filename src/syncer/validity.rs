//! Validity Gate
//!
//! Decides whether a Pod volume refers to a genuine driver volume by
//! resolving the PVC -> PV chain and applying the CSI migration policy.
//! The gate is consulted on every Pod volume touch; the migration switch
//! is read fresh on each call.

use super::filter::DriverIdentity;
use crate::domain::ports::ObjectCache;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Volume};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Why a volume reference was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// The Pod volume is not backed by a PVC
    NotAClaim,
    /// The referenced PVC is not in the cache
    ClaimLookupFailed,
    /// The PV bound to the PVC is not in the cache
    VolumeLookupFailed,
    /// The PV belongs to another driver
    NotDriverVolume,
    /// In-tree vSphere volume while migration is disabled
    MigrationDisabled,
}

/// Outcome of the validity check
#[derive(Debug, Clone)]
pub enum VolumeValidity {
    Valid {
        pv: Arc<PersistentVolume>,
        pvc: Arc<PersistentVolumeClaim>,
    },
    Invalid(InvalidReason),
}

impl VolumeValidity {
    pub fn is_valid(&self) -> bool {
        matches!(self, VolumeValidity::Valid { .. })
    }

    /// The resolved PV and PVC when valid
    pub fn into_resolved(self) -> Option<(Arc<PersistentVolume>, Arc<PersistentVolumeClaim>)> {
        match self {
            VolumeValidity::Valid { pv, pvc } => Some((pv, pvc)),
            VolumeValidity::Invalid(_) => None,
        }
    }
}

/// Determine whether a volume mounted by a Pod is a valid driver volume.
/// Returns the PV and PVC when it is.
pub fn is_valid_volume(
    cache: &dyn ObjectCache,
    identity: &DriverIdentity,
    pod: &Pod,
    volume: &Volume,
) -> VolumeValidity {
    let Some(claim) = volume.persistent_volume_claim.as_ref() else {
        return VolumeValidity::Invalid(InvalidReason::NotAClaim);
    };
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

    let validity = resolve_claim(cache, identity, namespace, &claim.claim_name);
    if !validity.is_valid() {
        debug!(
            pod = pod.metadata.name.as_deref().unwrap_or_default(),
            volume = %volume.name,
            "Skipping pod volume: {:?}",
            validity
        );
    }
    validity
}

/// Resolve a claim to its bound PV and apply the ownership policy.
///
/// Shared by the Pod gate and by claim-level sync.
pub fn resolve_claim(
    cache: &dyn ObjectCache,
    identity: &DriverIdentity,
    namespace: &str,
    claim_name: &str,
) -> VolumeValidity {
    let pvc = match cache.get_pvc(namespace, claim_name) {
        Ok(pvc) => pvc,
        Err(e) => {
            error!(
                "Error getting Persistent Volume Claim {}/{} with err: {}",
                namespace, claim_name, e
            );
            return VolumeValidity::Invalid(InvalidReason::ClaimLookupFailed);
        }
    };

    let volume_name = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .unwrap_or_default();
    let pv = match cache.get_pv(volume_name) {
        Ok(pv) => pv,
        Err(e) => {
            error!(
                "Error getting Persistent Volume for PVC {}/{} with err: {}",
                namespace, claim_name, e
            );
            return VolumeValidity::Invalid(InvalidReason::VolumeLookupFailed);
        }
    };

    if identity.is_csi_volume(&pv) {
        return VolumeValidity::Valid { pv, pvc };
    }
    if !DriverIdentity::is_in_tree_volume(&pv) {
        return VolumeValidity::Invalid(InvalidReason::NotDriverVolume);
    }
    if !identity.migration_enabled() {
        warn!(
            "volume-migration feature switch is disabled. Cannot update vSphere volume metadata {}",
            volume_name
        );
        return VolumeValidity::Invalid(InvalidReason::MigrationDisabled);
    }
    VolumeValidity::Valid { pv, pvc }
}
