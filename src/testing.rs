//! Test fixtures: object builders and an in-memory object cache

use crate::domain::ports::{ObjectCache, Selector};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeClaimVolumeSource,
    PersistentVolumeSpec, PersistentVolumeStatus, Pod, PodSpec, PodStatus, Volume,
    VsphereVirtualDiskVolumeSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DRIVER: &str = "csi.vsphere.vmware.com";

// =============================================================================
// Builders
// =============================================================================

fn meta(namespace: Option<&str>, name: &str, uid: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        uid: Some(uid.to_string()),
        ..Default::default()
    }
}

/// CSI PV with volume handle `vol-{name}`
pub fn pv(name: &str, uid: &str, driver: &str, phase: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: meta(None, name, uid),
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: driver.to_string(),
                volume_handle: format!("vol-{}", name),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// In-tree vSphere PV
pub fn legacy_pv(name: &str, uid: &str, phase: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: meta(None, name, uid),
        spec: Some(PersistentVolumeSpec {
            vsphere_volume: Some(VsphereVirtualDiskVolumeSource {
                volume_path: format!("[datastore1] kubevols/{}.vmdk", name),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Point a PV's claim reference at `namespace/claim`
pub fn bound_pv(mut pv: PersistentVolume, namespace: &str, claim: &str) -> PersistentVolume {
    pv.spec.get_or_insert_with(Default::default).claim_ref = Some(ObjectReference {
        namespace: Some(namespace.to_string()),
        name: Some(claim.to_string()),
        ..Default::default()
    });
    pv
}

/// PVC in phase Bound, bound to `volume` when given
pub fn pvc(namespace: &str, name: &str, uid: &str, volume: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(Some(namespace), name, uid),
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: volume.map(str::to_string),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        }),
    }
}

/// Running Pod mounting each claim through a volume of the same name
pub fn pod(namespace: &str, name: &str, uid: &str, claims: &[&str]) -> Pod {
    let volumes = claims
        .iter()
        .map(|claim| Volume {
            name: claim.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: meta(Some(namespace), name, uid),
        spec: Some(PodSpec {
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// Add labels to an object
pub fn labeled<K: Resource>(mut obj: K, labels: &[(&str, &str)]) -> K {
    let target = obj.meta_mut().labels.get_or_insert_with(Default::default);
    for (key, value) in labels {
        target.insert(key.to_string(), value.to_string());
    }
    obj
}

/// Add one annotation to an object
pub fn with_annotation<K: Resource>(mut obj: K, key: &str, value: &str) -> K {
    obj.meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
    obj
}

pub fn with_pod_phase(mut pod: Pod, phase: &str) -> Pod {
    pod.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
    pod
}

// =============================================================================
// Fake Object Cache
// =============================================================================

/// Object cache backed by plain vectors. Adding an object replaces any
/// cached object with the same namespace and name.
#[derive(Default)]
pub struct FakeObjectCache {
    pvs: RwLock<Vec<Arc<PersistentVolume>>>,
    pvcs: RwLock<Vec<Arc<PersistentVolumeClaim>>>,
    pods: RwLock<Vec<Arc<Pod>>>,
    fail_lists: AtomicBool,
}

fn same_object<K: Resource>(a: &K, b: &K) -> bool {
    a.meta().namespace == b.meta().namespace && a.meta().name == b.meta().name
}

fn replace<K: Resource>(objects: &RwLock<Vec<Arc<K>>>, obj: K) {
    let mut objects = objects.write();
    objects.retain(|existing| !same_object(existing.as_ref(), &obj));
    objects.push(Arc::new(obj));
}

fn in_scope<K: Resource>(obj: &K, namespace: Option<&str>, selector: &Selector) -> bool {
    namespace.map_or(true, |ns| obj.meta().namespace.as_deref() == Some(ns))
        && selector.matches(obj.meta().labels.as_ref())
}

fn find<K: Resource>(
    objects: &RwLock<Vec<Arc<K>>>,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
) -> Result<Arc<K>> {
    objects
        .read()
        .iter()
        .find(|obj| {
            obj.meta().namespace.as_deref() == namespace && obj.meta().name.as_deref() == Some(name)
        })
        .cloned()
        .ok_or_else(|| {
            let full = match namespace {
                Some(ns) => format!("{}/{}", ns, name),
                None => name.to_string(),
            };
            Error::lookup(kind, full)
        })
}

impl FakeObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pv(&self, pv: PersistentVolume) {
        replace(&self.pvs, pv);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        replace(&self.pvcs, pvc);
    }

    pub fn add_pod(&self, pod: Pod) {
        replace(&self.pods, pod);
    }

    pub fn remove_pv(&self, name: &str) {
        self.pvs.write().retain(|pv| pv.metadata.name.as_deref() != Some(name));
    }

    pub fn remove_pvc(&self, namespace: &str, name: &str) {
        self.pvcs.write().retain(|pvc| {
            pvc.metadata.namespace.as_deref() != Some(namespace)
                || pvc.metadata.name.as_deref() != Some(name)
        });
    }

    /// Make every list call fail as if the cache had not synced
    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    fn check_lists(&self, kind: &str) -> Result<()> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(Error::List {
                kind: kind.to_string(),
                reason: "cache not synced".to_string(),
            });
        }
        Ok(())
    }
}

impl ObjectCache for FakeObjectCache {
    fn list_pvs(&self, selector: &Selector) -> Result<Vec<Arc<PersistentVolume>>> {
        self.check_lists("PersistentVolume")?;
        Ok(self
            .pvs
            .read()
            .iter()
            .filter(|pv| in_scope(pv.as_ref(), None, selector))
            .cloned()
            .collect())
    }

    fn list_pvcs(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Arc<PersistentVolumeClaim>>> {
        self.check_lists("PersistentVolumeClaim")?;
        Ok(self
            .pvcs
            .read()
            .iter()
            .filter(|pvc| in_scope(pvc.as_ref(), namespace, selector))
            .cloned()
            .collect())
    }

    fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Arc<Pod>>> {
        self.check_lists("Pod")?;
        Ok(self
            .pods
            .read()
            .iter()
            .filter(|pod| in_scope(pod.as_ref(), namespace, selector))
            .cloned()
            .collect())
    }

    fn get_pv(&self, name: &str) -> Result<Arc<PersistentVolume>> {
        find(&self.pvs, "PersistentVolume", None, name)
    }

    fn get_pvc(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>> {
        find(&self.pvcs, "PersistentVolumeClaim", Some(namespace), name)
    }

    fn get_pod(&self, namespace: &str, name: &str) -> Result<Arc<Pod>> {
        find(&self.pods, "Pod", Some(namespace), name)
    }
}
