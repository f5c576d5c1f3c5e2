//! Driver for the external infrastructure-as-code engine
//!
//! Every piece of cloud infrastructure is described by an [`IacConfig`] and
//! owned by exactly one [`StateKey`]. The key fixes both the engine's remote
//! state path and its local working directory, so reconciles of the same
//! resource share a working directory and reconciles of different resources
//! never contend for one.

pub mod modules;
mod recording;
mod terraform;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub use recording::{IacOperation, Invocation, RecordingEngine};
pub use terraform::{Terraform, TerraformOptions};

/// File the configuration is written to inside a working directory
pub const CONFIG_FILE_NAME: &str = "config.tf.json";

/// What one piece of state belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateScope {
    Cluster,
    System { system_id: String },
    NodePool { node_pool_id: String, epoch: i64 },
    AddressLoadBalancer { address_id: String },
    Route53 { zone_id: String, name: String },
}

/// Identity of one engine state blob within a lattice
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    lattice_id: String,
    scope: StateScope,
}

impl StateKey {
    pub fn new(lattice_id: impl Into<String>, scope: StateScope) -> Self {
        Self {
            lattice_id: lattice_id.into(),
            scope,
        }
    }

    pub fn node_pool(lattice_id: &str, node_pool_id: &str, epoch: i64) -> Self {
        Self::new(
            lattice_id,
            StateScope::NodePool {
                node_pool_id: node_pool_id.to_string(),
                epoch,
            },
        )
    }

    pub fn address_load_balancer(lattice_id: &str, address_id: &str) -> Self {
        Self::new(
            lattice_id,
            StateScope::AddressLoadBalancer {
                address_id: address_id.to_string(),
            },
        )
    }

    pub fn route53(lattice_id: &str, zone_id: &str, name: &str) -> Self {
        Self::new(
            lattice_id,
            StateScope::Route53 {
                zone_id: zone_id.to_string(),
                name: name.to_string(),
            },
        )
    }

    pub fn scope(&self) -> &StateScope {
        &self.scope
    }

    /// `lattice/<latticeID>/...`; part of the external contract
    pub fn path(&self) -> String {
        let base = format!("lattice/{}", self.lattice_id);
        match &self.scope {
            StateScope::Cluster => format!("{base}/cluster"),
            StateScope::System { system_id } => format!("{base}/system/{system_id}"),
            StateScope::NodePool {
                node_pool_id,
                epoch,
            } => format!("{base}/node-pool/{node_pool_id}@{epoch}"),
            StateScope::AddressLoadBalancer { address_id } => {
                format!("{base}/address/service-load-balancer/{address_id}")
            }
            StateScope::Route53 { zone_id, name } => format!("{base}/route53/{zone_id}/{name}"),
        }
    }

    pub fn work_dir(&self, root: &Path) -> PathBuf {
        root.join(self.path())
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Outcome of a successful plan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanResult {
    /// Infrastructure already matches the configuration
    Empty,
    /// Applying would change something
    NonEmpty,
}

/// Where the engine keeps its authoritative state
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    pub bucket: String,
    pub region: String,
    /// Prepended to every state path
    #[serde(default)]
    pub key_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
struct TerraformBlock {
    backend: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct OutputBlock {
    value: String,
}

/// Engine configuration, serialized as the JSON configuration syntax
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IacConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    provider: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    terraform: Option<TerraformBlock>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    module: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    output: BTreeMap<String, OutputBlock>,
}

impl IacConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: &str, settings: Value) -> Self {
        self.provider.insert(name.to_string(), settings);
        self
    }

    /// Store state remotely under the key's path
    pub fn with_s3_backend(mut self, backend: &BackendConfig, key: &StateKey) -> Self {
        let path = match &backend.key_prefix {
            Some(prefix) => format!("{}/{}/terraform.tfstate", prefix.trim_end_matches('/'), key.path()),
            None => format!("{}/terraform.tfstate", key.path()),
        };
        let mut backends = BTreeMap::new();
        backends.insert(
            "s3".to_string(),
            serde_json::json!({
                "bucket": backend.bucket,
                "key": path,
                "region": backend.region,
                "encrypt": true,
            }),
        );
        self.terraform = Some(TerraformBlock { backend: backends });
        self
    }

    /// Add a module block; `inputs` must serialize to a JSON object
    pub fn with_module<M: Serialize>(mut self, name: &str, source: &str, inputs: &M) -> Result<Self> {
        let mut block = match serde_json::to_value(inputs)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::ConfigError(format!(
                    "module {name} inputs must be an object, got {other}"
                )))
            }
        };
        block.insert("source".to_string(), Value::String(source.to_string()));
        self.module.insert(name.to_string(), Value::Object(block));
        Ok(self)
    }

    /// Expose `module.<module>.<attribute>` as output `name`
    pub fn with_output(mut self, name: &str, module: &str, attribute: &str) -> Self {
        self.output.insert(
            name.to_string(),
            OutputBlock {
                value: format!("${{module.{module}.{attribute}}}"),
            },
        );
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Idempotent plan / apply / destroy engine
#[async_trait]
pub trait IacEngine: Send + Sync {
    /// Dry run. With `destroy`, plans the removal of everything in the state.
    async fn plan(&self, key: &StateKey, config: &IacConfig, destroy: bool) -> Result<PlanResult>;

    async fn apply(&self, key: &StateKey, config: &IacConfig) -> Result<()>;

    /// Destroy everything in the state. Remote state is never deleted, even
    /// when this fails.
    async fn destroy(&self, key: &StateKey, config: &IacConfig) -> Result<()>;

    /// Read named outputs of the last apply
    async fn output(
        &self,
        key: &StateKey,
        config: &IacConfig,
        names: &[&str],
    ) -> Result<BTreeMap<String, String>>;
}
