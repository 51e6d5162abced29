//! Object key resolution
//!
//! Queue keys follow the `namespace/name` convention (bare `name` for
//! cluster-scoped objects such as PVs).

use crate::domain::ports::WatchEvent;
use crate::error::{Error, Result};
use kube::Resource;
use tracing::{debug, error};

/// Canonical queue key for an object
pub fn meta_namespace_key<K: Resource>(obj: &K) -> Result<String> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::KeyResolution("object has no name".into()))?;

    Ok(match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{}/{}", namespace, name),
        _ => name.to_string(),
    })
}

/// Resolve the queue key for a watch event.
///
/// Tombstones are unwrapped to their last known object; if the tombstone
/// carries no object, its recorded key is used.
pub fn object_key<K: Resource>(event: &WatchEvent<K>) -> Result<String> {
    let resolved = match event {
        WatchEvent::Live(obj) => meta_namespace_key(obj.as_ref()),
        WatchEvent::Tombstone(tombstone) => match &tombstone.last_known {
            Some(obj) => meta_namespace_key(obj.as_ref()),
            None if !tombstone.key.is_empty() => Ok(tombstone.key.clone()),
            None => Err(Error::KeyResolution(
                "tombstone carries neither an object nor a key".into(),
            )),
        },
    };

    match &resolved {
        Ok(key) => debug!(key = %key, "Resolved object key"),
        Err(e) => error!("Failed to get key from object: {}", e),
    }
    resolved
}

/// Split a queue key into its namespace (if any) and name
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, key),
    }
}
