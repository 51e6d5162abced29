//! CnsVolumeMetadata CRD
//!
//! One object per cluster entity (PV, PVC or Pod) that references backend
//! volumes. Lets the syncer run against a Kubernetes namespace as its
//! metadata backend.

use crate::domain::ports::{entity_key, EntityKind, EntityReference};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Maximum length of a Kubernetes object name
const MAX_NAME_LEN: usize = 253;
const HASH_SUFFIX_LEN: usize = 8;

// =============================================================================
// CnsVolumeMetadata CRD
// =============================================================================

/// Metadata of a cluster entity and the backend volumes it references
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cns.vmware.com",
    version = "v1alpha1",
    kind = "CnsVolumeMetadata",
    plural = "cnsvolumemetadatas",
    shortname = "cnsvm",
    status = "CnsVolumeMetadataStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.entityType"}"#,
    printcolumn = r#"{"name": "Entity", "type": "string", "jsonPath": ".spec.entityName"}"#,
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.guestClusterId"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CnsVolumeMetadataSpec {
    /// Backend volume ids referenced by the entity
    #[serde(default)]
    pub volume_names: Vec<String>,

    /// Cluster the entity belongs to
    #[serde(default)]
    pub guest_cluster_id: String,

    /// Kind of the entity
    pub entity_type: EntityKind,

    /// Entity name
    pub entity_name: String,

    /// Entity namespace (unset for PVs)
    #[serde(default)]
    pub entity_namespace: Option<String>,

    /// Entity labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Entity UID
    pub uid: String,
}

/// Status of a CnsVolumeMetadata object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CnsVolumeMetadataStatus {
    /// Last time the syncer wrote this object
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
}

impl CnsVolumeMetadataSpec {
    /// Spec for a single reference; further volumes are merged in by the store
    pub fn from_reference(reference: &EntityReference) -> Self {
        let guest_cluster_id = reference.cluster_id().unwrap_or_default().to_string();
        Self {
            volume_names: vec![reference.volume_id.clone()],
            guest_cluster_id,
            entity_type: reference.kind,
            entity_name: reference.name.clone(),
            entity_namespace: reference.namespace.clone(),
            labels: reference.labels.clone(),
            uid: reference.uid.clone(),
        }
    }

    /// Add a volume id if it is not already listed
    pub fn add_volume(&mut self, volume_id: &str) {
        if !self.volume_names.iter().any(|v| v == volume_id) {
            self.volume_names.push(volume_id.to_string());
            self.volume_names.sort();
        }
    }

    /// Remove a volume id. Returns true if it was listed.
    pub fn remove_volume(&mut self, volume_id: &str) -> bool {
        let before = self.volume_names.len();
        self.volume_names.retain(|v| v != volume_id);
        self.volume_names.len() != before
    }

    /// One entity reference per listed volume
    pub fn references(&self) -> impl Iterator<Item = EntityReference> + '_ {
        self.volume_names.iter().map(move |volume_id| EntityReference {
            volume_id: volume_id.clone(),
            key: entity_key(&self.guest_cluster_id, &self.uid),
            uid: self.uid.clone(),
            kind: self.entity_type,
            name: self.entity_name.clone(),
            namespace: self.entity_namespace.clone(),
            labels: self.labels.clone(),
        })
    }
}

/// Object name for an entity key: lowercase, restricted to `[a-z0-9-.]`
/// and trimmed to start and end with an alphanumeric character. Keys that
/// need rewriting get a short digest of the raw key appended.
pub fn metadata_object_name(key: &str) -> String {
    let mapped: String = key
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect();
    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if !key.is_empty() && trimmed == key && key.len() <= MAX_NAME_LEN {
        return key.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    let suffix = &digest[..HASH_SUFFIX_LEN];

    let mut name: String = trimmed
        .chars()
        .take(MAX_NAME_LEN - HASH_SUFFIX_LEN - 1)
        .collect();
    while name.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        name.pop();
    }

    if name.is_empty() {
        format!("entity-{}", suffix)
    } else {
        format!("{}-{}", name, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn reference(volume_id: &str) -> EntityReference {
        EntityReference {
            volume_id: volume_id.to_string(),
            key: entity_key("gc-1", "uid-1"),
            uid: "uid-1".into(),
            kind: EntityKind::PersistentVolumeClaim,
            name: "data".into(),
            namespace: Some("apps".into()),
            labels: BTreeMap::from([("app".to_string(), "db".to_string())]),
        }
    }

    #[test]
    fn test_crd_definition() {
        let crd = CnsVolumeMetadata::crd();
        assert_eq!(crd.spec.group, "cns.vmware.com");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "CnsVolumeMetadata");
    }

    #[test]
    fn test_spec_round_trips_references() {
        let mut spec = CnsVolumeMetadataSpec::from_reference(&reference("vol-b"));
        spec.add_volume("vol-a");
        spec.add_volume("vol-b");
        assert_eq!(spec.volume_names, vec!["vol-a", "vol-b"]);

        let refs: Vec<_> = spec.references().collect();
        assert_eq!(refs, vec![reference("vol-a"), reference("vol-b")]);

        assert!(spec.remove_volume("vol-a"));
        assert!(!spec.remove_volume("vol-a"));
        assert_eq!(spec.volume_names, vec!["vol-b"]);
    }

    #[test]
    fn test_entity_type_serialization() {
        let spec = CnsVolumeMetadataSpec::from_reference(&reference("vol-a"));
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["entityType"], "PERSISTENT_VOLUME_CLAIM");
        assert_eq!(json["guestClusterId"], "gc-1");
        assert_eq!(json["entityNamespace"], "apps");
    }

    #[test]
    fn test_metadata_object_name() {
        assert_eq!(metadata_object_name("gc-1uid-1"), "gc-1uid-1");
        assert_eq!(metadata_object_name("a.b-c"), "a.b-c");

        let mapped = metadata_object_name("Cluster_A:5f0d");
        assert!(mapped.starts_with("cluster-a-5f0d-"));
        assert_eq!(mapped.len(), "cluster-a-5f0d-".len() + HASH_SUFFIX_LEN);

        assert!(metadata_object_name("--x--").starts_with("x-"));
        assert!(metadata_object_name("__").starts_with("entity-"));
        assert!(metadata_object_name("").starts_with("entity-"));
        assert!(metadata_object_name(&"a".repeat(300)).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_colliding_keys_get_distinct_names() {
        let upper = metadata_object_name("GC-1uid");
        let lower = metadata_object_name("gc-1uid");
        let underscore = metadata_object_name("gc_1uid");
        assert_eq!(lower, "gc-1uid");
        assert_ne!(upper, lower);
        assert_ne!(underscore, lower);
        assert_ne!(upper, underscore);

        let long_a = format!("{}a", "x".repeat(300));
        let long_b = format!("{}b", "x".repeat(300));
        assert_ne!(metadata_object_name(&long_a), metadata_object_name(&long_b));
        // Same key, same name
        assert_eq!(metadata_object_name("GC-1uid"), upper);
    }
}
