//! Informers
//!
//! Watch PersistentVolumes, PersistentVolumeClaims and Pods, keep local
//! caches of them and deliver change callbacks to the syncer.

pub mod cache;
pub mod stream;

pub use cache::*;
pub use stream::*;
