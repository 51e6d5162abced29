//! CNS Metadata Syncer
//!
//! A Kubernetes controller that keeps the entity references stored by a
//! volume backend in line with the PersistentVolumes, PersistentVolumeClaims
//! and Pods of the cluster that use those volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Kubernetes API Server                       │
//! └───────────────┬──────────────────────────────────────────────────┘
//!                 │ watch (PV / PVC / Pod)
//! ┌───────────────┴──────────────┐      ┌────────────────────────────┐
//! │          Informers           │─────▶│       Object Cache         │
//! │   add / update / delete      │      │  (reflector stores)        │
//! └───────────────┬──────────────┘      └─────────────┬──────────────┘
//!                 │ callbacks                         │ reads
//! ┌───────────────┴───────────────────────────────────┴──────────────┐
//! │                        Metadata Syncer                           │
//! │   ┌────────────────────┐            ┌────────────────────────┐   │
//! │   │  Incremental Sync  │            │       Full Sync        │   │
//! │   │  (work queue)      │            │  (filter, diff, push)  │   │
//! │   └─────────┬──────────┘            └───────────┬────────────┘   │
//! └─────────────┼───────────────────────────────────┼────────────────┘
//!               │ upsert / delete                   │ paginated query
//! ┌─────────────┴───────────────────────────────────┴────────────────┐
//! │                  Volume Backend (CRD / in-memory)                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`syncer`]: Sync engine, filters, validity gate and pagination
//! - [`informer`]: Watches and local object caches
//! - [`backend`]: Backend adapters
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod backend;
pub mod crd;
pub mod domain;
pub mod error;
pub mod informer;
pub mod syncer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use backend::{CrdEntityStore, InMemoryVolumeStore};

pub use crd::{CnsVolumeMetadata, CnsVolumeMetadataSpec, CnsVolumeMetadataStatus};

pub use domain::ports::{
    EntityKind, EntityRefId, EntityReference, EntityReferenceStore, ObjectCache, QueryFilter,
    QueryResult, ResourceEventHandler, Selector, VolumeQueryClient, WatchEvent,
};

pub use error::{Error, ErrorAction, Result};

pub use informer::{Informer, KubeObjectCache};

pub use syncer::{
    DriverIdentity, FullSyncReport, MetadataSyncer, SyncMetrics, SyncerConfig, VolumePhase,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
