//! Config Custom Resource Definition
//!
//! One Config object, named `config`, lives in each lattice's internal
//! namespace and carries the parameters that may change without
//! redeploying the controller manager.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.mlab.com",
    version = "v1",
    kind = "Config",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    #[serde(default)]
    pub cloud_provider: ConfigCloudProvider,

    #[serde(default)]
    pub container_build: ConfigContainerBuild,

    #[serde(default)]
    pub service_mesh: ConfigServiceMesh,
}

impl ConfigSpec {
    pub fn validate(&self) -> Result<()> {
        if self.cloud_provider.aws.is_some() && self.cloud_provider.local.is_some() {
            return Err(Error::ValidationError(
                "config must not set both aws and local cloud provider blocks".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCloudProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<ConfigAws>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<ConfigLocal>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAws {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_node_ami_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    /// Overrides the subnets the cluster was bootstrapped with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_ids: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigLocal {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigContainerBuild {
    /// Image that runs git-sourced container builds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_registry: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigServiceMesh {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy: Option<ConfigEnvoy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEnvoy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// First mesh port handed out to component ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_base: Option<i32>,
}
