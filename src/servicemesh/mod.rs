//! Service mesh integration
//!
//! The mesh sits in front of every component port: traffic for a Service's
//! port is sent to the mesh port assigned to it, and the mesh forwards it to
//! the component. The assignment is recorded on the workload so the Address
//! controller can target it.

mod envoy;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crd::{ConfigServiceMesh, Service};
use crate::error::{Error, Result};
use crate::orchestrator::WorkloadSpec;

pub use envoy::{Envoy, EnvoyOptions, ANNOTATION_KEY_SERVICE_MESH_PORTS};

pub trait ServiceMesh: Send + Sync {
    fn name(&self) -> &'static str;

    /// Component port to mesh port
    fn service_mesh_ports(&self, service: &Service) -> BTreeMap<i32, i32>;

    /// Add the mesh's containers and annotations to a Service's workload
    fn transform_workload_spec(&self, service: &Service, spec: &mut WorkloadSpec) -> Result<()>;

    /// Port table recorded by [`ServiceMesh::transform_workload_spec`]
    fn service_mesh_ports_from_annotations(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<i32, i32>>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceMeshOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy: Option<EnvoyOptions>,
}

impl ServiceMeshOptions {
    pub fn overlay(&self, dynamic: &ConfigServiceMesh) -> Self {
        Self {
            envoy: self
                .envoy
                .as_ref()
                .map(|envoy| match &dynamic.envoy {
                    Some(config) => envoy.overlay(config),
                    None => envoy.clone(),
                }),
        }
    }
}

pub fn new_service_mesh(options: &ServiceMeshOptions) -> Result<Box<dyn ServiceMesh>> {
    match &options.envoy {
        Some(envoy) => Ok(Box::new(Envoy::new(envoy.clone())?)),
        None => Err(Error::ConfigError(
            "a service mesh must be configured".to_string(),
        )),
    }
}
