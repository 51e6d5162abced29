//! Watch stream processing
//!
//! Applies kube watcher events to a reflector store and turns them into
//! add, update and delete callbacks. Notifications are computed against
//! the store before each event is applied and delivered after it, so a
//! handler always sees the cache in its post-event state.
//!
//! After a relist, objects the store held that are missing from the new
//! listing are reported as deletes carrying their last known state.

use super::cache::CacheReader;
use crate::domain::ports::{ResourceEventHandler, Tombstone, WatchEvent};
use crate::syncer::keys::meta_namespace_key;
use futures::{pin_mut, StreamExt};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback to deliver for one applied watch event
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Add(Arc<K>),
    Update(Arc<K>, Arc<K>),
    Delete(WatchEvent<K>),
}

impl<K> Notification<K> {
    pub fn deliver<H>(self, handler: &H)
    where
        H: ResourceEventHandler<K> + ?Sized,
    {
        match self {
            Notification::Add(obj) => handler.on_add(WatchEvent::Live(obj)),
            Notification::Update(old, new) => handler.on_update(&old, &new),
            Notification::Delete(event) => handler.on_delete(event),
        }
    }
}

fn same_version<K: Resource>(old: &K, new: &K) -> bool {
    let version = |obj: &K| obj.meta().resource_version.clone();
    version(old).is_some() && version(old) == version(new)
}

// =============================================================================
// Informer
// =============================================================================

/// Store writer plus the read handle shared with the object cache
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: reflector::store::Writer<K>,
    store: Store<K>,
    ready: watch::Sender<bool>,
    reader: CacheReader<K>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        let (store, writer) = reflector::store();
        let (ready, ready_rx) = watch::channel(false);
        let reader = CacheReader::new(kind, store.clone(), ready_rx);
        Self {
            writer,
            store,
            ready,
            reader,
        }
    }

    pub fn reader(&self) -> CacheReader<K> {
        self.reader.clone()
    }

    /// Apply one watcher event and return the callbacks it implies
    pub fn apply(&mut self, event: Event<K>) -> Vec<Notification<K>> {
        match &event {
            Event::Applied(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                let new = Arc::new(obj.clone());
                match old {
                    Some(old) if same_version(old.as_ref(), new.as_ref()) => Vec::new(),
                    Some(old) => vec![Notification::Update(old, new)],
                    None => vec![Notification::Add(new)],
                }
            }
            Event::Deleted(obj) => {
                self.writer.apply_watcher_event(&event);
                vec![Notification::Delete(WatchEvent::Live(Arc::new(obj.clone())))]
            }
            Event::Restarted(objs) => {
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect();
                self.writer.apply_watcher_event(&event);

                let mut notifications = Vec::new();
                for obj in objs {
                    let new = Arc::new(obj.clone());
                    match previous.remove(&ObjectRef::from_obj(obj)) {
                        Some(old) if same_version(old.as_ref(), obj) => {}
                        Some(old) => notifications.push(Notification::Update(old, new)),
                        None => notifications.push(Notification::Add(new)),
                    }
                }
                for (_, gone) in previous {
                    let key = meta_namespace_key(gone.as_ref()).unwrap_or_default();
                    notifications.push(Notification::Delete(WatchEvent::Tombstone(Tombstone {
                        key,
                        last_known: Some(gone),
                    })));
                }

                if !*self.ready.borrow() {
                    info!(kind = self.reader.kind(), objects = objs.len(), "Cache synced");
                    self.ready.send_replace(true);
                }
                notifications
            }
        }
    }

    /// Watch `api` and deliver callbacks to `handler` until `shutdown` fires
    pub async fn run<H>(mut self, api: Api<K>, handler: Arc<H>, shutdown: CancellationToken)
    where
        H: ResourceEventHandler<K> + ?Sized,
    {
        let kind = self.reader.kind();
        info!(kind, "Starting informer");

        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        pin_mut!(stream);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        for notification in self.apply(event) {
                            notification.deliver(handler.as_ref());
                        }
                    }
                    Some(Err(e)) => warn!(kind, "Watch error, retrying: {}", e),
                    None => {
                        warn!(kind, "Watch stream ended");
                        break;
                    }
                },
            }
        }
        debug!(kind, "Informer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ObjectCache, Selector};
    use crate::informer::KubeObjectCache;
    use crate::testing::{pod, pv, pvc, with_pod_phase, DRIVER};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
    use parking_lot::Mutex;

    fn versioned(mut obj: Pod, version: &str) -> Pod {
        obj.metadata.resource_version = Some(version.to_string());
        obj
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ResourceEventHandler<Pod> for Recorder {
        fn on_add(&self, event: WatchEvent<Pod>) {
            let name = event.object().and_then(|p| p.metadata.name.clone());
            self.seen.lock().push(format!("add {}", name.unwrap_or_default()));
        }

        fn on_update(&self, _old: &Arc<Pod>, new: &Arc<Pod>) {
            let name = new.metadata.name.clone().unwrap_or_default();
            self.seen.lock().push(format!("update {}", name));
        }

        fn on_delete(&self, event: WatchEvent<Pod>) {
            let label = match &event {
                WatchEvent::Live(p) => format!("delete {}", p.metadata.name.clone().unwrap_or_default()),
                WatchEvent::Tombstone(t) => format!("tombstone {}", t.key),
            };
            self.seen.lock().push(label);
        }
    }

    fn deliver_all(informer: &mut Informer<Pod>, event: Event<Pod>, recorder: &Recorder) {
        for notification in informer.apply(event) {
            notification.deliver(recorder);
        }
    }

    #[test]
    fn test_applied_events_become_add_then_update() {
        let mut informer = Informer::<Pod>::new("Pod");
        let recorder = Recorder::default();

        let first = versioned(pod("apps", "web-0", "uid-1", &["data"]), "1");
        deliver_all(&mut informer, Event::Applied(first.clone()), &recorder);
        // Same resource version is a resync, not a change
        deliver_all(&mut informer, Event::Applied(first.clone()), &recorder);
        let second = versioned(with_pod_phase(first, "Succeeded"), "2");
        deliver_all(&mut informer, Event::Applied(second), &recorder);
        deliver_all(
            &mut informer,
            Event::Deleted(versioned(pod("apps", "web-0", "uid-1", &["data"]), "3")),
            &recorder,
        );

        assert_eq!(
            *recorder.seen.lock(),
            vec!["add web-0", "update web-0", "delete web-0"]
        );
        assert!(informer.reader().store().state().is_empty());
    }

    #[test]
    fn test_relist_reports_missed_deletes_as_tombstones() {
        let mut informer = Informer::<Pod>::new("Pod");
        let recorder = Recorder::default();

        deliver_all(
            &mut informer,
            Event::Restarted(vec![
                versioned(pod("apps", "kept", "uid-1", &[]), "1"),
                versioned(pod("apps", "gone", "uid-2", &[]), "1"),
            ]),
            &recorder,
        );
        recorder.seen.lock().clear();

        deliver_all(
            &mut informer,
            Event::Restarted(vec![
                versioned(pod("apps", "kept", "uid-1", &[]), "1"),
                versioned(pod("apps", "new", "uid-3", &[]), "5"),
            ]),
            &recorder,
        );

        let mut seen = recorder.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["add new", "tombstone apps/gone"]);
    }

    #[test]
    fn test_cache_lists_only_after_initial_sync() {
        let mut pvs = Informer::<PersistentVolume>::new("PersistentVolume");
        let mut pvcs = Informer::<PersistentVolumeClaim>::new("PersistentVolumeClaim");
        let mut pods = Informer::<Pod>::new("Pod");
        let cache = KubeObjectCache::new(pvs.reader(), pvcs.reader(), pods.reader());

        assert_matches!(
            cache.list_pvs(&Selector::everything()),
            Err(crate::error::Error::List { .. })
        );

        pvs.apply(Event::Restarted(vec![pv("pv-1", "uid-1", DRIVER, "Bound")]));
        pvcs.apply(Event::Restarted(vec![pvc("apps", "data", "uid-2", Some("pv-1"))]));
        pods.apply(Event::Restarted(vec![pod("apps", "web-0", "uid-3", &["data"])]));

        assert!(cache.is_ready());
        assert_eq!(cache.list_pvs(&Selector::everything()).unwrap().len(), 1);
        assert_eq!(cache.list_pods(Some("apps"), &Selector::everything()).unwrap().len(), 1);
        assert!(cache.list_pods(Some("other"), &Selector::everything()).unwrap().is_empty());
        assert!(cache.get_pvc("apps", "data").is_ok());
        assert_matches!(
            cache.get_pod("apps", "missing"),
            Err(crate::error::Error::Lookup { .. })
        );
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let mut pods = Informer::<Pod>::new("Pod");
        let reader = pods.reader();
        let waiter = tokio::spawn(async move { reader.wait_until_ready().await });

        pods.apply(Event::Restarted(Vec::new()));
        assert!(waiter.await.unwrap());
    }
}
