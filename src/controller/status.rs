//! Status and annotation writes shared by the reconcilers

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::error;

use crate::cloudprovider::NodePoolEpochInfo;
use crate::crd::meta::ANNOTATION_KEY_NODE_POOL_EPOCH_INFO;
use crate::crd::{HasStatus, NodePool};
use crate::error::{Error, Result};
use crate::store::{LatticeResource, TypedStore};

/// Write `status` unless `obj` already carries it. Returns the stored object.
pub async fn update_status<K>(api: &TypedStore<K>, obj: &K, status: K::Status) -> Result<K>
where
    K: LatticeResource + HasStatus,
{
    if obj.status() == Some(&status) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    *updated.status_mut() = Some(status);
    api.replace_status(&updated).await
}

/// Merge-patch annotations; `None` removes a key. Skips the write when
/// nothing would change.
pub async fn patch_annotations<K: LatticeResource>(
    api: &TypedStore<K>,
    obj: &K,
    changes: BTreeMap<String, Option<String>>,
) -> Result<K> {
    let current = obj.annotations();
    let changed = changes
        .iter()
        .any(|(key, value)| current.get(key) != value.as_ref());
    if !changed {
        return Ok(obj.clone());
    }
    let annotations: Map<String, Value> = changes
        .into_iter()
        .map(|(key, value)| (key, value.map_or(Value::Null, Value::String)))
        .collect();
    let patch = json!({
        "metadata": {
            "annotations": annotations,
            "resourceVersion": obj.resource_version(),
        }
    });
    api.patch(&obj.namespace().unwrap_or_default(), &obj.name_any(), &patch)
        .await
}

/// Surface infrastructure left behind by a failed destroy. The remote
/// state is kept so the destroy can be retried.
pub fn alarm_orphaned_state(kind: &str, resource: &str, err: &Error) {
    error!(
        alarm = "orphaned-iac-state",
        kind,
        resource,
        error = %err,
        "Destroy failed; remote IaC state is orphaned until a retry succeeds"
    );
    #[cfg(feature = "metrics")]
    crate::controller::metrics::record_orphaned_state(kind);
}

type EpochInfoTable = BTreeMap<i64, NodePoolEpochInfo>;

fn epoch_info_table(pool: &NodePool) -> Result<EpochInfoTable> {
    match pool.annotations().get(ANNOTATION_KEY_NODE_POOL_EPOCH_INFO) {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(EpochInfoTable::new()),
    }
}

fn epoch_info_value(table: &EpochInfoTable) -> Result<Option<String>> {
    if table.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(table)?))
}

/// Infrastructure facts recorded for one epoch of `pool`
pub fn epoch_info(pool: &NodePool, epoch: i64) -> Result<Option<NodePoolEpochInfo>> {
    Ok(epoch_info_table(pool)?.remove(&epoch))
}

/// Annotation change that records `info` for `epoch`
pub fn with_epoch_info(
    pool: &NodePool,
    epoch: i64,
    info: NodePoolEpochInfo,
) -> Result<BTreeMap<String, Option<String>>> {
    let mut table = epoch_info_table(pool)?;
    table.insert(epoch, info);
    Ok(BTreeMap::from([(
        ANNOTATION_KEY_NODE_POOL_EPOCH_INFO.to_string(),
        epoch_info_value(&table)?,
    )]))
}

/// Annotation change that forgets `epoch`
pub fn without_epoch_info(pool: &NodePool, epoch: i64) -> Result<BTreeMap<String, Option<String>>> {
    let mut table = epoch_info_table(pool)?;
    table.remove(&epoch);
    Ok(BTreeMap::from([(
        ANNOTATION_KEY_NODE_POOL_EPOCH_INFO.to_string(),
        epoch_info_value(&table)?,
    )]))
}
