//! Envoy sidecar mesh

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ServiceMesh;
use crate::crd::{ConfigEnvoy, Service};
use crate::error::{Error, Result};
use crate::orchestrator::{Container, ContainerPort, HostPathVolume, VolumeMount, WorkloadSpec};

pub const ANNOTATION_KEY_SERVICE_MESH_PORTS: &str =
    "envoy.servicemesh.lattice.mlab.com/service-mesh-ports";
pub const ANNOTATION_KEY_ADMIN_PORT: &str = "envoy.servicemesh.lattice.mlab.com/admin-port";
pub const ANNOTATION_KEY_EGRESS_PORTS: &str = "envoy.servicemesh.lattice.mlab.com/egress-ports";

const CONTAINER_NAME: &str = "envoy-envoy";
const CONFIG_DIRECTORY: &str = "/etc/envoy";
const CONFIG_VOLUME: &str = "envoy-envoyconfig";
const CONFIG_HOST_PATH_PREFIX: &str = "/var/lib/lattice/envoy";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnvoyOptions {
    #[serde(default = "default_image")]
    pub image: String,
    /// First port handed out to the mesh
    #[serde(default = "default_port_base")]
    pub port_base: i32,
    #[serde(default = "default_xds_api_port")]
    pub xds_api_port: i32,
}

fn default_image() -> String {
    "envoyproxy/envoy:v1.30-latest".to_string()
}

fn default_port_base() -> i32 {
    10000
}

fn default_xds_api_port() -> i32 {
    8080
}

impl Default for EnvoyOptions {
    fn default() -> Self {
        Self {
            image: default_image(),
            port_base: default_port_base(),
            xds_api_port: default_xds_api_port(),
        }
    }
}

impl EnvoyOptions {
    pub fn overlay(&self, config: &ConfigEnvoy) -> Self {
        Self {
            image: config.image.clone().unwrap_or_else(|| self.image.clone()),
            port_base: config.port_base.unwrap_or(self.port_base),
            xds_api_port: self.xds_api_port,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct EgressPorts {
    http: i32,
    tcp: i32,
}

/// Ports Envoy listens on for one Service
#[derive(Debug, PartialEq, Eq)]
struct Assignment {
    mesh_ports: BTreeMap<i32, i32>,
    admin: i32,
    egress: EgressPorts,
}

pub struct Envoy {
    options: EnvoyOptions,
}

impl Envoy {
    pub fn new(options: EnvoyOptions) -> Result<Self> {
        if !(1..=65535).contains(&options.port_base) {
            return Err(Error::ConfigError(format!(
                "envoy port base {} is out of range",
                options.port_base
            )));
        }
        Ok(Self { options })
    }

    /// Walks up from the port base in component port order, skipping ports
    /// a component already uses. The same ports always get the same table.
    fn assign(&self, service: &Service) -> Assignment {
        let used: BTreeSet<i32> = service.spec.ports.iter().map(|p| p.port).collect();
        let mut candidates = (self.options.port_base..).filter(|p| !used.contains(p));
        let mut next = || candidates.next().unwrap_or_default();

        let mesh_ports = used.iter().map(|port| (*port, next())).collect();
        let admin = next();
        let egress = EgressPorts {
            http: next(),
            tcp: next(),
        };
        Assignment {
            mesh_ports,
            admin,
            egress,
        }
    }
}

impl ServiceMesh for Envoy {
    fn name(&self) -> &'static str {
        "envoy"
    }

    fn service_mesh_ports(&self, service: &Service) -> BTreeMap<i32, i32> {
        self.assign(service).mesh_ports
    }

    fn transform_workload_spec(&self, service: &Service, spec: &mut WorkloadSpec) -> Result<()> {
        let assignment = self.assign(service);
        spec.annotations.insert(
            ANNOTATION_KEY_SERVICE_MESH_PORTS.to_string(),
            serde_json::to_string(&assignment.mesh_ports)?,
        );
        spec.annotations.insert(
            ANNOTATION_KEY_ADMIN_PORT.to_string(),
            assignment.admin.to_string(),
        );
        spec.annotations.insert(
            ANNOTATION_KEY_EGRESS_PORTS.to_string(),
            serde_json::to_string(&assignment.egress)?,
        );

        let ports = service
            .spec
            .ports
            .iter()
            .filter_map(|port| {
                assignment.mesh_ports.get(&port.port).map(|mesh| ContainerPort {
                    name: format!("envoy-{}", port.name),
                    port: *mesh,
                    protocol: port.protocol,
                })
            })
            .collect();

        spec.volumes.retain(|v| v.name != CONFIG_VOLUME);
        spec.volumes.push(HostPathVolume {
            name: CONFIG_VOLUME.to_string(),
            host_path: format!("{CONFIG_HOST_PATH_PREFIX}/{}/{}", spec.namespace, spec.name),
        });
        spec.containers.retain(|c| c.name != CONTAINER_NAME);
        spec.containers.push(Container {
            name: CONTAINER_NAME.to_string(),
            image: self.options.image.clone(),
            command: Some(vec!["/usr/local/bin/envoy".to_string()]),
            args: vec![
                "-c".to_string(),
                format!("{CONFIG_DIRECTORY}/config.json"),
                "--service-cluster".to_string(),
                spec.namespace.clone(),
                "--service-node".to_string(),
                service.spec.path.to_domain(),
            ],
            env: [
                ("ADMIN_PORT", assignment.admin.to_string()),
                ("EGRESS_PORT", assignment.egress.http.to_string()),
                ("XDS_API_PORT", self.options.xds_api_port.to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
            ports,
            resources: Default::default(),
            volume_mounts: vec![VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_DIRECTORY.to_string(),
            }],
        });
        Ok(())
    }

    fn service_mesh_ports_from_annotations(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<i32, i32>> {
        let raw = annotations
            .get(ANNOTATION_KEY_SERVICE_MESH_PORTS)
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "workload has no {ANNOTATION_KEY_SERVICE_MESH_PORTS} annotation"
                ))
            })?;
        Ok(serde_json::from_str(raw)?)
    }
}
