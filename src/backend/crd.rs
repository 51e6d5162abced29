//! CRD backend
//!
//! Stores entity references as CnsVolumeMetadata objects, one per entity,
//! in a single namespace. Writes use server-side apply so repeated upserts
//! of the same state are no-ops on the API server.

use super::paginate;
use crate::crd::{
    metadata_object_name, CnsVolumeMetadata, CnsVolumeMetadataSpec, CnsVolumeMetadataStatus,
};
use crate::domain::ports::{
    EntityRefId, EntityReference, EntityReferenceStore, QueryFilter, QueryResult,
    VolumeQueryClient,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "cns-metadata-syncer";

/// Entity reference store backed by CnsVolumeMetadata objects
#[derive(Clone)]
pub struct CrdEntityStore {
    api: Api<CnsVolumeMetadata>,
    namespace: String,
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 404)
}

impl CrdEntityStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        info!(namespace, "Using CnsVolumeMetadata backend");
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<Option<CnsVolumeMetadata>> {
        Ok(self.api.get_opt(name).await?)
    }

    /// Desired object for an apply. Carrying the resourceVersion that was
    /// read makes a concurrent writer's change fail with a conflict.
    fn desired(
        &self,
        name: &str,
        spec: CnsVolumeMetadataSpec,
        resource_version: Option<String>,
    ) -> CnsVolumeMetadata {
        let mut object = CnsVolumeMetadata::new(name, spec);
        object.metadata.namespace = Some(self.namespace.clone());
        object.metadata.resource_version = resource_version;
        object
    }

    async fn apply(
        &self,
        name: &str,
        spec: CnsVolumeMetadataSpec,
        resource_version: Option<String>,
    ) -> Result<()> {
        let object = self.desired(name, spec, resource_version);

        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api.patch(name, &params, &Patch::Apply(&object)).await?;

        let status = json!({
            "status": CnsVolumeMetadataStatus {
                last_synced: Some(Utc::now()),
            }
        });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VolumeQueryClient for CrdEntityStore {
    async fn query(&self, filter: &QueryFilter) -> Result<Option<QueryResult>> {
        let objects = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Query(format!("listing CnsVolumeMetadata: {}", e)))?;

        let mut volumes: BTreeMap<String, Vec<EntityReference>> = BTreeMap::new();
        for object in &objects.items {
            for reference in object.spec.references() {
                volumes
                    .entry(reference.volume_id.clone())
                    .or_default()
                    .push(reference);
            }
        }

        Ok(Some(paginate(volumes, filter)))
    }
}

#[async_trait]
impl EntityReferenceStore for CrdEntityStore {
    async fn upsert(&self, reference: &EntityReference) -> Result<()> {
        let name = metadata_object_name(&reference.key);
        let mut spec = CnsVolumeMetadataSpec::from_reference(reference);

        let existing = self
            .get(&name)
            .await
            .map_err(|e| Error::update(&reference.key, e))?;
        let mut resource_version = None;
        if let Some(existing) = existing {
            for volume_id in &existing.spec.volume_names {
                spec.add_volume(volume_id);
            }
            resource_version = existing.metadata.resource_version;
        }

        debug!(object = %name, id = %reference.id(), "Applying CnsVolumeMetadata");
        self.apply(&name, spec, resource_version)
            .await
            .map_err(|e| Error::update(&reference.key, e))
    }

    async fn delete(&self, id: &EntityRefId) -> Result<()> {
        let name = metadata_object_name(&id.key);
        let Some(existing) = self.get(&name).await.map_err(|e| Error::update(&id.key, e))? else {
            return Ok(());
        };

        let resource_version = existing.metadata.resource_version;
        let mut spec = existing.spec;
        if !spec.remove_volume(&id.volume_id) {
            return Ok(());
        }

        if !spec.volume_names.is_empty() {
            debug!(object = %name, id = %id, "Removing volume from CnsVolumeMetadata");
            return self
                .apply(&name, spec, resource_version)
                .await
                .map_err(|e| Error::update(&id.key, e));
        }

        debug!(object = %name, id = %id, "Deleting CnsVolumeMetadata");
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version,
                uid: None,
            }),
            ..DeleteParams::default()
        };
        match self.api.delete(&name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::update(&id.key, e)),
        }
    }
}

impl std::fmt::Debug for CrdEntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdEntityStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
