//! Custom Resource Definitions
//!
//! - CnsVolumeMetadata: entity metadata stored by the CRD backend

pub mod volume_metadata;

pub use volume_metadata::*;
