//! Benchmarks for the full sync hot path: volume filtering and diffing
//!
//! Target: 10K volumes filtered and diffed well under a second

use cns_metadata_syncer::domain::ports::{entity_key, EntityKind, EntityReference};
use cns_metadata_syncer::syncer::{diff, volumes_in_bound_available_or_released, DriverIdentity};
use cns_metadata_syncer::{ObjectCache, Result, Selector};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
    PersistentVolumeStatus, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;

const DRIVER: &str = "csi.vsphere.vmware.com";
const PHASES: &[&str] = &["Bound", "Available", "Released", "Pending", "Failed"];

struct PvOnlyCache {
    pvs: Vec<Arc<PersistentVolume>>,
}

impl ObjectCache for PvOnlyCache {
    fn list_pvs(&self, _selector: &Selector) -> Result<Vec<Arc<PersistentVolume>>> {
        Ok(self.pvs.clone())
    }

    fn list_pvcs(
        &self,
        _namespace: Option<&str>,
        _selector: &Selector,
    ) -> Result<Vec<Arc<PersistentVolumeClaim>>> {
        Ok(Vec::new())
    }

    fn list_pods(&self, _namespace: Option<&str>, _selector: &Selector) -> Result<Vec<Arc<Pod>>> {
        Ok(Vec::new())
    }

    fn get_pv(&self, name: &str) -> Result<Arc<PersistentVolume>> {
        Err(cns_metadata_syncer::Error::lookup("PersistentVolume", name))
    }

    fn get_pvc(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>> {
        Err(cns_metadata_syncer::Error::lookup(
            "PersistentVolumeClaim",
            format!("{}/{}", namespace, name),
        ))
    }

    fn get_pod(&self, namespace: &str, name: &str) -> Result<Arc<Pod>> {
        Err(cns_metadata_syncer::Error::lookup("Pod", format!("{}/{}", namespace, name)))
    }
}

fn volume(i: usize) -> PersistentVolume {
    let driver = if i % 4 == 0 { "other.csi.io" } else { DRIVER };
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(format!("pv-{:05}", i)),
            uid: Some(format!("uid-{:05}", i)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            csi: Some(CSIPersistentVolumeSource {
                driver: driver.to_string(),
                volume_handle: format!("vol-{:05}", i),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(PHASES[i % PHASES.len()].to_string()),
            ..Default::default()
        }),
    }
}

fn reference(i: usize, cluster: &str) -> EntityReference {
    let uid = format!("uid-{:05}", i);
    EntityReference {
        volume_id: format!("vol-{:05}", i),
        key: entity_key(cluster, &uid),
        uid,
        kind: EntityKind::PersistentVolume,
        name: format!("pv-{:05}", i),
        namespace: None,
        labels: Default::default(),
    }
}

fn bench_filter_volumes(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_filter");
    group.throughput(Throughput::Elements(10_000));

    let cache = PvOnlyCache {
        pvs: (0..10_000).map(|i| Arc::new(volume(i))).collect(),
    };
    let identity = DriverIdentity::new(DRIVER, false);

    group.bench_function("bound_available_or_released_10k", |b| {
        b.iter(|| {
            let selected = volumes_in_bound_available_or_released(black_box(&cache), &identity);
            black_box(selected.map(|pvs| pvs.len()).unwrap_or_default())
        });
    });

    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_filter");
    group.throughput(Throughput::Elements(10_000));

    let expected: Vec<_> = (0..10_000).map(|i| reference(i, "gc-1")).collect();
    // A tenth of the backend state is stale, another tenth is foreign
    let actual: Vec<_> = (1_000..11_000)
        .map(|i| reference(i, if i % 10 == 0 { "gc-2" } else { "gc-1" }))
        .collect();

    group.bench_function("diff_10k", |b| {
        b.iter(|| {
            let delta = diff(
                black_box(expected.clone()),
                black_box(actual.clone()),
                "gc-1",
            );
            black_box(delta.upserts.len() + delta.deletes.len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_filter_volumes, bench_diff);
criterion_main!(benches);
