//! Syncer metrics
//!
//! Prometheus collectors registered on a registry owned by the caller, so
//! that tests can use a throwaway registry and the binary can expose the
//! same one on `/metrics`.

use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

/// Metrics for full and incremental sync
#[derive(Clone)]
pub struct SyncMetrics {
    /// Full sync passes by result (success, failure, skipped)
    pub full_sync_runs: IntCounterVec,
    /// Full sync duration in seconds
    pub full_sync_duration: Histogram,
    /// Backend entity reference operations by op (upsert, delete) and result
    pub entity_operations: IntCounterVec,
    /// Watch events dropped because no key could be resolved, by kind
    pub dropped_events: IntCounterVec,
    /// Keys waiting in the work queue
    pub queue_depth: IntGauge,
}

impl SyncMetrics {
    /// Create the collectors and register them on `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let full_sync_runs = IntCounterVec::new(
            Opts::new("cns_syncer_full_sync_runs_total", "Full sync passes by result"),
            &["result"],
        )?;
        let full_sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cns_syncer_full_sync_duration_seconds",
                "Duration of full sync passes",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        let entity_operations = IntCounterVec::new(
            Opts::new(
                "cns_syncer_entity_operations_total",
                "Backend entity reference operations",
            ),
            &["op", "result"],
        )?;
        let dropped_events = IntCounterVec::new(
            Opts::new(
                "cns_syncer_dropped_events_total",
                "Watch events dropped because their key could not be resolved",
            ),
            &["kind"],
        )?;
        let queue_depth = IntGauge::new("cns_syncer_queue_depth", "Keys waiting in the work queue")?;

        registry.register(Box::new(full_sync_runs.clone()))?;
        registry.register(Box::new(full_sync_duration.clone()))?;
        registry.register(Box::new(entity_operations.clone()))?;
        registry.register(Box::new(dropped_events.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            full_sync_runs,
            full_sync_duration,
            entity_operations,
            dropped_events,
            queue_depth,
        })
    }

    pub fn record_operation(&self, op: &str, ok: bool) {
        self.entity_operations
            .with_label_values(&[op, if ok { "success" } else { "failure" }])
            .inc();
    }
}

impl std::fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMetrics").finish_non_exhaustive()
    }
}
