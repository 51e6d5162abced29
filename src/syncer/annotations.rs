//! Migration annotation transition detection

use std::collections::BTreeMap;
use tracing::debug;

/// Annotation set on PVs/PVCs once they are managed by the CSI driver
/// instead of the in-tree plugin.
pub const ANN_MIGRATED_TO: &str = "pv.kubernetes.io/migrated-to";

/// Returns true only when the migrated-to annotation appears in `new` and
/// was absent from `prev`.
///
/// This is an edge detector: an object that already carried the annotation
/// has been migrated and must not be processed again.
pub fn has_migrated_to_annotation(
    prev: Option<&BTreeMap<String, String>>,
    new: Option<&BTreeMap<String, String>>,
) -> bool {
    let in_new = new.map_or(false, |ann| ann.contains_key(ANN_MIGRATED_TO));
    let in_prev = prev.map_or(false, |ann| ann.contains_key(ANN_MIGRATED_TO));

    if in_new && !in_prev {
        debug!("Received {} annotation update", ANN_MIGRATED_TO);
        return true;
    }
    false
}
