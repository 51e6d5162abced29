//! Volume State Filter
//!
//! Selects the cached PVs owned by this driver whose lifecycle phase is
//! relevant to metadata sync. Both the broad (Bound/Available/Released) and
//! narrow (Bound) selections run through [`volumes_in_phases`].

use crate::domain::ports::{ObjectCache, Selector};
use crate::error::Result;
use k8s_openapi::api::core::v1::PersistentVolume;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Volume Phase
// =============================================================================

/// PersistentVolume lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumePhase {
    Pending,
    Available,
    Bound,
    Released,
    Failed,
}

impl VolumePhase {
    /// Parse the phase reported in a PV status
    pub fn of(pv: &PersistentVolume) -> Option<Self> {
        let phase = pv.status.as_ref()?.phase.as_deref()?;
        match phase {
            "Pending" => Some(VolumePhase::Pending),
            "Available" => Some(VolumePhase::Available),
            "Bound" => Some(VolumePhase::Bound),
            "Released" => Some(VolumePhase::Released),
            "Failed" => Some(VolumePhase::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Pending => write!(f, "Pending"),
            VolumePhase::Available => write!(f, "Available"),
            VolumePhase::Bound => write!(f, "Bound"),
            VolumePhase::Released => write!(f, "Released"),
            VolumePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Phases considered by a full sync
pub const SYNCED_PHASES: &[VolumePhase] = &[
    VolumePhase::Bound,
    VolumePhase::Available,
    VolumePhase::Released,
];

/// Phases in which a volume is attached to a claim
pub const BOUND_PHASES: &[VolumePhase] = &[VolumePhase::Bound];

// =============================================================================
// Driver Identity
// =============================================================================

/// Identifies which volumes belong to this driver.
///
/// The migration switch is shared so that it can be changed at runtime;
/// every ownership check reads its current value.
#[derive(Debug, Clone)]
pub struct DriverIdentity {
    name: String,
    csi_migration: Arc<AtomicBool>,
}

impl DriverIdentity {
    pub fn new(name: impl Into<String>, csi_migration: bool) -> Self {
        Self {
            name: name.into(),
            csi_migration: Arc::new(AtomicBool::new(csi_migration)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn migration_enabled(&self) -> bool {
        self.csi_migration.load(Ordering::Acquire)
    }

    pub fn set_migration_enabled(&self, enabled: bool) {
        self.csi_migration.store(enabled, Ordering::Release);
    }

    /// Check whether the PV is a CSI volume of this driver
    pub fn is_csi_volume(&self, pv: &PersistentVolume) -> bool {
        pv.spec
            .as_ref()
            .and_then(|spec| spec.csi.as_ref())
            .map_or(false, |csi| csi.driver == self.name)
    }

    /// Check whether the PV is an in-tree vSphere volume
    pub fn is_in_tree_volume(pv: &PersistentVolume) -> bool {
        pv.spec
            .as_ref()
            .map_or(false, |spec| spec.vsphere_volume.is_some())
    }

    /// Driver-owned: a CSI volume of this driver, or an in-tree vSphere
    /// volume while migration is enabled.
    pub fn owns(&self, pv: &PersistentVolume) -> bool {
        self.is_csi_volume(pv) || (Self::is_in_tree_volume(pv) && self.migration_enabled())
    }
}

/// Backend volume id for a PV: the CSI volume handle, or the in-tree
/// volume path for a migrated vSphere volume.
pub fn volume_id(pv: &PersistentVolume) -> Option<&str> {
    let spec = pv.spec.as_ref()?;
    if let Some(csi) = &spec.csi {
        return Some(csi.volume_handle.as_str());
    }
    spec.vsphere_volume
        .as_ref()
        .map(|source| source.volume_path.as_str())
}

// =============================================================================
// Filter
// =============================================================================

/// Return the cached PVs owned by this driver whose phase is in `phases`.
///
/// Output order is unspecified. Only a failing cache listing is an error;
/// non-matching PVs are silently skipped.
pub fn volumes_in_phases(
    cache: &dyn ObjectCache,
    identity: &DriverIdentity,
    phases: &[VolumePhase],
) -> Result<Vec<Arc<PersistentVolume>>> {
    let all_pvs = cache.list_pvs(&Selector::everything())?;

    let selected: Vec<_> = all_pvs
        .into_iter()
        .filter(|pv| {
            if !identity.owns(pv) {
                return false;
            }
            let phase = VolumePhase::of(pv);
            debug!(
                pv = pv.metadata.name.as_deref().unwrap_or_default(),
                volume_id = volume_id(pv).unwrap_or_default(),
                phase = ?phase,
                "Checking PV phase"
            );
            phase.map_or(false, |phase| phases.contains(&phase))
        })
        .collect();

    Ok(selected)
}

/// PVs in Bound, Available or Released state
pub fn volumes_in_bound_available_or_released(
    cache: &dyn ObjectCache,
    identity: &DriverIdentity,
) -> Result<Vec<Arc<PersistentVolume>>> {
    debug!("Getting all PVs in Bound, Available or Released state");
    volumes_in_phases(cache, identity, SYNCED_PHASES)
}

/// PVs in Bound state
pub fn bound_volumes(
    cache: &dyn ObjectCache,
    identity: &DriverIdentity,
) -> Result<Vec<Arc<PersistentVolume>>> {
    volumes_in_phases(cache, identity, BOUND_PHASES)
}
