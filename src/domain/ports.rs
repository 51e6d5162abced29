//! Domain Ports - Core trait definitions for the metadata syncer
//!
//! These traits define the boundaries between the sync engine and the
//! collaborators it depends on: the cluster object cache, the backend volume
//! query service, the backend entity-reference store and the watch source.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Label Selector
// =============================================================================

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key=value` on matched objects
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_everything(&self) -> bool {
        self.0.is_empty()
    }

    /// Check whether a label set satisfies this selector
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(k, v)| {
            labels
                .and_then(|labels| labels.get(k))
                .map_or(false, |actual| actual == v)
        })
    }
}

// =============================================================================
// Object Cache Port
// =============================================================================

/// Read-only view over the locally cached cluster objects.
///
/// Reads are local and non-blocking once the cache has been populated.
/// Listing before the initial population fails with `Error::List`; a `get`
/// for an absent object fails with `Error::Lookup`.
pub trait ObjectCache: Send + Sync {
    /// List cached PersistentVolumes
    fn list_pvs(&self, selector: &Selector) -> Result<Vec<Arc<PersistentVolume>>>;

    /// List cached PersistentVolumeClaims, optionally within one namespace
    fn list_pvcs(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Arc<PersistentVolumeClaim>>>;

    /// List cached Pods, optionally within one namespace
    fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Arc<Pod>>>;

    /// Get a PersistentVolume by name
    fn get_pv(&self, name: &str) -> Result<Arc<PersistentVolume>>;

    /// Get a PersistentVolumeClaim by namespace and name
    fn get_pvc(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>>;

    /// Get a Pod by namespace and name
    fn get_pod(&self, namespace: &str, name: &str) -> Result<Arc<Pod>>;
}

// =============================================================================
// Entity References
// =============================================================================

/// Kind of cluster object an entity reference describes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    PersistentVolume,
    PersistentVolumeClaim,
    Pod,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::PersistentVolume => write!(f, "PERSISTENT_VOLUME"),
            EntityKind::PersistentVolumeClaim => write!(f, "PERSISTENT_VOLUME_CLAIM"),
            EntityKind::Pod => write!(f, "POD"),
        }
    }
}

/// Build the backend-side key for a cluster object.
///
/// The backend names entities by concatenating the cluster id and the
/// object UID with no separator.
pub fn entity_key(cluster_id: &str, uid: &str) -> String {
    format!("{}{}", cluster_id, uid)
}

/// Recover the cluster id from a composite entity key by removing the UID
/// suffix. Returns `None` when the key does not end with the UID.
pub fn cluster_id_from_key<'a>(key: &'a str, uid: &str) -> Option<&'a str> {
    key.strip_suffix(uid)
}

/// Identity of one entity reference in the backend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRefId {
    /// Backend volume the reference is attached to
    pub volume_id: String,
    /// Composite entity key (cluster id + object UID)
    pub key: String,
}

impl std::fmt::Display for EntityRefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key, self.volume_id)
    }
}

/// Backend record linking a volume to a cluster object using it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReference {
    /// Backend volume id
    pub volume_id: String,
    /// Composite entity key (cluster id + object UID)
    pub key: String,
    /// UID of the referenced object
    pub uid: String,
    /// Kind of the referenced object
    pub kind: EntityKind,
    /// Object name
    pub name: String,
    /// Object namespace (None for PVs)
    pub namespace: Option<String>,
    /// Current labels of the object
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl EntityReference {
    pub fn id(&self) -> EntityRefId {
        EntityRefId {
            volume_id: self.volume_id.clone(),
            key: self.key.clone(),
        }
    }

    /// Cluster id this reference belongs to
    pub fn cluster_id(&self) -> Option<&str> {
        cluster_id_from_key(&self.key, &self.uid)
    }
}

// =============================================================================
// Backend Query Types
// =============================================================================

/// Pagination cursor for backend volume queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub offset: u64,
    pub limit: u64,
    /// Only meaningful on a returned cursor
    pub total_records: u64,
}

impl Cursor {
    /// Cursor requesting the first page
    pub fn first_page(limit: u64) -> Self {
        Self {
            offset: 0,
            limit,
            total_records: 0,
        }
    }

    /// Check whether this returned cursor covers all records
    pub fn is_exhausted(&self) -> bool {
        self.offset == self.total_records
    }
}

/// Filter for backend volume queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    /// Restrict to these volume ids (empty = all volumes)
    pub volume_ids: Vec<String>,
    /// Restrict to volumes referenced by these clusters (empty = any cluster)
    pub cluster_ids: Vec<String>,
    pub cursor: Cursor,
}

/// A backend volume and the entity references attached to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    pub volume_id: String,
    pub entity_references: Vec<EntityReference>,
}

/// One page of a backend volume query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub volumes: Vec<VolumeRecord>,
    pub cursor: Cursor,
}

// =============================================================================
// Backend Ports
// =============================================================================

/// Port for querying backend volume records
#[async_trait]
pub trait VolumeQueryClient: Send + Sync {
    /// Run one paginated query. `Ok(None)` means the backend returned no result.
    async fn query(&self, filter: &QueryFilter) -> Result<Option<QueryResult>>;
}

/// Port for persisting entity references in the backend.
///
/// Both operations are idempotent upserts/deletes; deleting an absent
/// reference succeeds.
#[async_trait]
pub trait EntityReferenceStore: Send + Sync {
    /// Create or replace an entity reference
    async fn upsert(&self, reference: &EntityReference) -> Result<()>;

    /// Remove an entity reference
    async fn delete(&self, id: &EntityRefId) -> Result<()>;
}

// =============================================================================
// Watch Event Port
// =============================================================================

/// Payload of a watch notification.
///
/// A delete may be observed only after a relist, in which case the final
/// state of the object is unknown and the event carries the last state the
/// cache held (if any) together with its queue key.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Live(Arc<K>),
    Tombstone(Tombstone<K>),
}

/// Last known state of an object whose deletion was missed
#[derive(Debug, Clone)]
pub struct Tombstone<K> {
    /// Queue key recorded for the object (may be empty)
    pub key: String,
    pub last_known: Option<Arc<K>>,
}

impl<K> WatchEvent<K> {
    /// The object carried by the event, live or last known
    pub fn object(&self) -> Option<&Arc<K>> {
        match self {
            WatchEvent::Live(obj) => Some(obj),
            WatchEvent::Tombstone(tombstone) => tombstone.last_known.as_ref(),
        }
    }
}

/// Callbacks delivered by the watch source for one object kind
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, event: WatchEvent<K>);

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);

    fn on_delete(&self, event: WatchEvent<K>);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectCacheRef = Arc<dyn ObjectCache>;
pub type VolumeQueryClientRef = Arc<dyn VolumeQueryClient>;
pub type EntityReferenceStoreRef = Arc<dyn EntityReferenceStore>;
