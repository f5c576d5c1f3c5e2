//! Resolved System definition: the workload tree a Build turns into images

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{NodePoolSelection, ResourceRequests, ServicePort, TreePath};
use crate::error::{Error, Result};

/// A System definition at one version, keyed by workload tree path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemDefinition {
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadDefinition>,
    /// Node pools shared by several workloads, keyed by pool name
    #[serde(default)]
    pub node_pools: BTreeMap<String, NodePoolDefinition>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    #[default]
    Service,
    Job,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDefinition {
    #[serde(default)]
    pub kind: WorkloadKind,
    pub build: ContainerBuildSource,
    #[serde(default = "default_instances")]
    pub instances: i32,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub resources: ResourceRequests,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool: Option<NodePoolSelection>,
}

fn default_instances() -> i32 {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolDefinition {
    pub instance_type: String,
    pub num_instances: i32,
}

/// Where a workload's image comes from; exactly one of `dockerImage` and
/// `gitRepository` is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBuildSource {
    /// A prebuilt image used as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<GitRepositorySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySource {
    pub url: String,
    /// Commit SHA or tag to check out
    pub reference: String,
}

impl ContainerBuildSource {
    pub fn validate(&self) -> Result<()> {
        match (&self.docker_image, &self.git_repository) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::ValidationError(
                "container build must set exactly one of dockerImage or gitRepository".to_string(),
            )),
        }
    }
}

impl SystemDefinition {
    pub fn validate(&self) -> Result<()> {
        for (path, workload) in &self.workloads {
            let parsed = TreePath::parse(path)?;
            if parsed.is_root() {
                return Err(Error::ValidationError(
                    "the root path cannot hold a workload".to_string(),
                ));
            }
            workload
                .build
                .validate()
                .map_err(|e| Error::ValidationError(format!("{path}: {e}")))?;
            if workload.instances < 0 {
                return Err(Error::ValidationError(format!(
                    "{path}: instances must not be negative"
                )));
            }
            if workload.kind == WorkloadKind::Service {
                let selection = workload.node_pool.as_ref().ok_or_else(|| {
                    Error::ValidationError(format!("{path}: service has no node pool"))
                })?;
                selection
                    .validate()
                    .map_err(|e| Error::ValidationError(format!("{path}: {e}")))?;
                if let Some(shared) = &selection.shared {
                    if !self.node_pools.contains_key(shared) {
                        return Err(Error::ValidationError(format!(
                            "{path}: references undeclared node pool {shared}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The workloads lying under `path`; node pools are kept whole
    pub fn subtree(&self, path: &TreePath) -> SystemDefinition {
        let workloads = self
            .workloads
            .iter()
            .filter(|(p, _)| TreePath::parse(p).is_ok_and(|p| path.contains(&p)))
            .map(|(p, w)| (p.clone(), w.clone()))
            .collect();
        SystemDefinition {
            workloads,
            node_pools: self.node_pools.clone(),
        }
    }

    pub fn services(&self) -> impl Iterator<Item = (&String, &WorkloadDefinition)> {
        self.workloads
            .iter()
            .filter(|(_, w)| w.kind == WorkloadKind::Service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(pool: &str) -> WorkloadDefinition {
        WorkloadDefinition {
            kind: WorkloadKind::Service,
            build: ContainerBuildSource {
                docker_image: Some("nginx:1.25".to_string()),
                ..Default::default()
            },
            instances: 2,
            ports: vec![],
            env: BTreeMap::new(),
            command: None,
            resources: ResourceRequests::default(),
            node_pool: Some(NodePoolSelection {
                shared: Some(pool.to_string()),
                dedicated: None,
            }),
        }
    }

    #[test]
    fn test_undeclared_shared_pool_is_rejected() {
        let mut def = SystemDefinition::default();
        def.workloads.insert("/api".to_string(), service("missing"));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("undeclared node pool"));
    }

    #[test]
    fn test_subtree_keeps_descendants_only() {
        let mut def = SystemDefinition::default();
        def.node_pools.insert(
            "default".to_string(),
            NodePoolDefinition {
                instance_type: "small".to_string(),
                num_instances: 1,
            },
        );
        def.workloads.insert("/a/api".to_string(), service("default"));
        def.workloads.insert("/a/web".to_string(), service("default"));
        def.workloads.insert("/b/db".to_string(), service("default"));
        assert!(def.validate().is_ok());

        let sub = def.subtree(&TreePath::parse("/a").unwrap());
        assert_eq!(sub.workloads.len(), 2);
        assert!(sub.workloads.contains_key("/a/api"));
        assert_eq!(sub.node_pools.len(), 1);
    }
}
