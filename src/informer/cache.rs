//! Reflector-backed object cache
//!
//! Each watched kind keeps a kube reflector store plus a readiness flag
//! that flips once the first full listing has been applied.

use crate::domain::ports::{ObjectCache, Selector};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;
use std::sync::Arc;
use tokio::sync::watch;

/// Read side of one kind's cache
#[derive(Clone)]
pub struct CacheReader<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: &'static str,
    store: Store<K>,
    ready: watch::Receiver<bool>,
}

impl<K> CacheReader<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub(crate) fn new(kind: &'static str, store: Store<K>, ready: watch::Receiver<bool>) -> Self {
        Self { kind, store, ready }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Whether the initial listing has been applied
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait for the initial listing. Returns false if the watch stopped first.
    pub async fn wait_until_ready(&self) -> bool {
        let mut ready = self.ready.clone();
        let synced = ready.wait_for(|ready| *ready).await.is_ok();
        synced
    }

    pub(crate) fn store(&self) -> &Store<K> {
        &self.store
    }

    fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Arc<K>>> {
        if !self.is_ready() {
            return Err(Error::List {
                kind: self.kind.to_string(),
                reason: "cache has not synced yet".to_string(),
            });
        }
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|obj| {
                namespace.map_or(true, |ns| obj.meta().namespace.as_deref() == Some(ns))
                    && selector.matches(obj.meta().labels.as_ref())
            })
            .collect())
    }

    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Arc<K>> {
        let mut reference = ObjectRef::<K>::new(name);
        let full_name = match namespace {
            Some(ns) => {
                reference = reference.within(ns);
                format!("{}/{}", ns, name)
            }
            None => name.to_string(),
        };
        self.store
            .get(&reference)
            .ok_or_else(|| Error::lookup(self.kind, full_name))
    }
}

/// Object cache over the PV, PVC and Pod informers
#[derive(Clone)]
pub struct KubeObjectCache {
    pvs: CacheReader<PersistentVolume>,
    pvcs: CacheReader<PersistentVolumeClaim>,
    pods: CacheReader<Pod>,
}

impl KubeObjectCache {
    pub fn new(
        pvs: CacheReader<PersistentVolume>,
        pvcs: CacheReader<PersistentVolumeClaim>,
        pods: CacheReader<Pod>,
    ) -> Self {
        Self { pvs, pvcs, pods }
    }

    pub fn is_ready(&self) -> bool {
        self.pvs.is_ready() && self.pvcs.is_ready() && self.pods.is_ready()
    }

    /// Wait until every kind has completed its initial listing
    pub async fn wait_until_ready(&self) -> bool {
        self.pvs.wait_until_ready().await
            && self.pvcs.wait_until_ready().await
            && self.pods.wait_until_ready().await
    }
}

impl ObjectCache for KubeObjectCache {
    fn list_pvs(&self, selector: &Selector) -> Result<Vec<Arc<PersistentVolume>>> {
        self.pvs.list(None, selector)
    }

    fn list_pvcs(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Arc<PersistentVolumeClaim>>> {
        self.pvcs.list(namespace, selector)
    }

    fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Arc<Pod>>> {
        self.pods.list(namespace, selector)
    }

    fn get_pv(&self, name: &str) -> Result<Arc<PersistentVolume>> {
        self.pvs.get(None, name)
    }

    fn get_pvc(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>> {
        self.pvcs.get(Some(namespace), name)
    }

    fn get_pod(&self, namespace: &str, name: &str) -> Result<Arc<Pod>> {
        self.pods.get(Some(namespace), name)
    }
}

impl std::fmt::Debug for KubeObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectCache")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}
