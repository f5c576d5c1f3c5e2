//! Finalizer handling for lattice resources
//!
//! Each controller that owns external effects of a resource places its own
//! finalizer token on it. The store keeps a deleted resource around until
//! every token is gone, so a controller removes its token only once the
//! effects have been reversed.

use kube::ResourceExt;
use serde_json::json;
use tracing::info;

use crate::crd::meta::{has_finalizer, is_being_deleted};
use crate::error::Result;
use crate::store::{LatticeResource, TypedStore};

/// Add `finalizer` to `obj` if not present and return the stored object.
///
/// Objects already being deleted are returned unchanged; a finalizer
/// cannot be added after deletion was requested.
pub async fn add_finalizer<K: LatticeResource>(
    api: &TypedStore<K>,
    obj: &K,
    finalizer: &str,
) -> Result<K> {
    if has_finalizer(obj.meta(), finalizer) || is_being_deleted(obj.meta()) {
        return Ok(obj.clone());
    }
    let mut finalizers: Vec<String> = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());

    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    let patched = api
        .patch(
            &obj.namespace().unwrap_or_default(),
            &obj.name_any(),
            &patch,
        )
        .await?;
    info!(kind = api.kind(), name = %obj.name_any(), finalizer, "Added finalizer");
    Ok(patched)
}

/// Remove `finalizer` once cleanup is complete. If it was the last token on
/// an object being deleted, the store removes the object.
pub async fn remove_finalizer<K: LatticeResource>(
    api: &TypedStore<K>,
    obj: &K,
    finalizer: &str,
) -> Result<()> {
    if !has_finalizer(obj.meta(), finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();

    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    });
    api.patch(
        &obj.namespace().unwrap_or_default(),
        &obj.name_any(),
        &patch,
    )
    .await?;

    info!(kind = api.kind(), name = %obj.name_any(), finalizer, "Removed finalizer");
    Ok(())
}
