//! Labels, annotations, finalizers and naming shared by every lattice resource

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use sha2::{Digest, Sha256};

pub const GROUP: &str = "lattice.mlab.com";

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "lattice-controller-manager";

pub const LABEL_KEY_SYSTEM_ID: &str = "lattice.mlab.com/system";
pub const LABEL_KEY_SERVICE_ID: &str = "service.lattice.mlab.com/id";
pub const LABEL_KEY_SERVICE_PATH: &str = "service.lattice.mlab.com/path";
pub const LABEL_KEY_BUILD_ID: &str = "build.lattice.mlab.com/id";
pub const LABEL_KEY_CONTAINER_BUILD_ID: &str = "container-build.lattice.mlab.com/id";
pub const LABEL_KEY_DEPLOY_ID: &str = "deploy.lattice.mlab.com/id";
pub const LABEL_KEY_JOB_ID: &str = "job.lattice.mlab.com/id";
pub const LABEL_KEY_ADDRESS_ID: &str = "address.lattice.mlab.com/id";
pub const LABEL_KEY_NODE_POOL_ID: &str = "node-pool.lattice.mlab.com/id";
pub const LABEL_KEY_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// JSON `{namespace: {pool: [epoch, ...]}}` naming every node pool epoch a
/// Service's workload may currently be running on
pub const ANNOTATION_KEY_NODE_POOL: &str = "node-pool.lattice.mlab.com/assignments";

/// Hash of the desired workload spec last written to the orchestrator
pub const ANNOTATION_KEY_SPEC_HASH: &str = "lattice.mlab.com/spec-hash";

/// Per-epoch infrastructure facts recorded by the cloud provider, as JSON
/// `{epoch: {key: value}}`
pub const ANNOTATION_KEY_NODE_POOL_EPOCH_INFO: &str = "node-pool.lattice.mlab.com/epoch-info";

pub const SYSTEM_FINALIZER: &str = "system.lattice.mlab.com/finalizer";
pub const SERVICE_FINALIZER: &str = "service.lattice.mlab.com/finalizer";
pub const JOB_FINALIZER: &str = "job.lattice.mlab.com/finalizer";
pub const NODE_POOL_FINALIZER: &str = "node-pool.lattice.mlab.com/finalizer";
pub const ADDRESS_FINALIZER: &str = "address.lattice.mlab.com/finalizer";

/// Name of the per-lattice Config singleton
pub const CONFIG_NAME: &str = "config";

/// Namespace holding lattice-wide objects (Config, leader lease)
pub fn internal_namespace(lattice_id: &str) -> String {
    format!("{lattice_id}-internal")
}

/// Namespace holding a System and everything it owns
pub fn system_namespace(lattice_id: &str, system_id: &str) -> String {
    format!("{lattice_id}-system-{system_id}")
}

/// Inverse of [`system_namespace`]
pub fn system_id_from_namespace<'a>(lattice_id: &str, namespace: &'a str) -> Option<&'a str> {
    namespace
        .strip_prefix(lattice_id)
        .and_then(|rest| rest.strip_prefix("-system-"))
        .filter(|id| !id.is_empty())
}

/// First eight hex characters of the SHA-256 of `input`
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Owner reference pointing at `owner`, marking it as the controller
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    let meta = owner.meta();
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn is_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == owner_uid))
}

/// A deletion timestamp means deletion was requested and finalizers are draining
pub fn is_being_deleted(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// RFC 3339 timestamp used in status fields
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
