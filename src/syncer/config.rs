//! Syncer configuration
//!
//! Loaded from an optional YAML file and overridden by command-line flags in
//! the binary. The CSI migration switch is not read from here at runtime;
//! it is copied into [`DriverIdentity`](super::filter::DriverIdentity) which
//! can be flipped while the syncer is running.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name the vSphere CSI driver registers with
pub const DEFAULT_DRIVER_NAME: &str = "csi.vsphere.vmware.com";

/// Page size for backend volume queries
pub const QUERY_VOLUME_LIMIT: u64 = 100;

/// Configuration for the metadata syncer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncerConfig {
    /// CSI driver name volumes must carry to be owned by this syncer
    pub driver_name: String,
    /// Prefix identifying this cluster in backend entity keys
    pub cluster_id: String,
    /// Treat in-tree vSphere volumes as owned (CSI migration feature)
    pub csi_migration: bool,
    /// Page size for backend volume queries
    pub query_page_limit: u64,
    /// Full sync interval in seconds
    pub full_sync_interval_secs: u64,
    /// Number of incremental sync workers
    pub workers: usize,
    /// Initial per-key retry delay in milliseconds
    pub retry_initial_delay_ms: u64,
    /// Maximum per-key retry delay in seconds
    pub retry_max_delay_secs: u64,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            cluster_id: String::new(),
            csi_migration: false,
            query_page_limit: QUERY_VOLUME_LIMIT,
            full_sync_interval_secs: 30 * 60,
            workers: 4,
            retry_initial_delay_ms: 500,
            retry_max_delay_secs: 300,
        }
    }
}

impl SyncerConfig {
    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: SyncerConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.driver_name.trim().is_empty() {
            return Err(Error::Configuration("driverName must not be empty".into()));
        }
        if self.query_page_limit == 0 {
            return Err(Error::Configuration(
                "queryPageLimit must be greater than zero".into(),
            ));
        }
        if self.full_sync_interval_secs == 0 {
            return Err(Error::Configuration(
                "fullSyncIntervalSecs must be greater than zero".into(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be greater than zero".into()));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_secs.saturating_mul(1000) {
            return Err(Error::Configuration(
                "retryInitialDelayMs exceeds retryMaxDelaySecs".into(),
            ));
        }
        Ok(())
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_secs)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    /// Cluster scope for backend queries (None when no cluster id is set)
    pub fn cluster_scope(&self) -> Option<&str> {
        if self.cluster_id.is_empty() {
            None
        } else {
            Some(&self.cluster_id)
        }
    }
}
