//! Metadata Syncer
//!
//! Keeps backend entity references for driver-owned volumes in line with
//! the PersistentVolumes, PersistentVolumeClaims and Pods of the cluster:
//! - Filter: select driver-owned PVs by phase
//! - Validity gate: decide whether a Pod volume is a driver volume
//! - Entity derivation and diff against backend state
//! - Paginated backend queries
//! - Full and incremental sync engine

pub mod annotations;
pub mod config;
pub mod engine;
pub mod entity;
pub mod filter;
pub mod keys;
pub mod metrics;
pub mod pagination;
pub mod queue;
pub mod validity;

pub use annotations::{has_migrated_to_annotation, ANN_MIGRATED_TO};
pub use config::SyncerConfig;
pub use engine::{FullSyncReport, MetadataSyncer, PendingWork, SyncScope, WorkItem};
pub use entity::{diff, expected_references, EntityDiff};
pub use filter::{
    bound_volumes, volume_id, volumes_in_bound_available_or_released, volumes_in_phases,
    DriverIdentity, VolumePhase,
};
pub use keys::{meta_namespace_key, object_key};
pub use metrics::SyncMetrics;
pub use pagination::query_all;
pub use queue::WorkQueue;
pub use validity::{is_valid_volume, InvalidReason, VolumeValidity};
