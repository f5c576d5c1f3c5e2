//! Local provider: a single-node cluster with no cloud infrastructure

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    port_url, CloudProvider, DnsRecord, LoadBalancerInfo, LoadBalancerTarget, NodePoolEpochInfo,
};
use crate::crd::{Address, NodePool, NodePoolEpochStatus};
use crate::error::Result;
use crate::orchestrator::WorkloadSpec;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalOptions {
    /// Address node ports are reachable on
    #[serde(default = "default_cluster_ip")]
    pub cluster_ip: String,
}

fn default_cluster_ip() -> String {
    "127.0.0.1".to_string()
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            cluster_ip: default_cluster_ip(),
        }
    }
}

pub struct LocalCloudProvider {
    options: LocalOptions,
}

impl LocalCloudProvider {
    pub fn new(options: LocalOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl CloudProvider for LocalCloudProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    /// Every pool runs on the same node, so a pool never rolls to a new epoch
    fn node_pool_needs_new_epoch(&self, pool: &NodePool) -> bool {
        pool.current_epoch().is_none()
    }

    async fn provision_node_pool_epoch(
        &self,
        pool: &NodePool,
        epoch: i64,
        _params: &NodePoolEpochStatus,
        _existing: Option<&NodePoolEpochInfo>,
    ) -> Result<NodePoolEpochInfo> {
        debug!(node_pool = %pool.id(), epoch, "Nothing to provision locally");
        Ok(NodePoolEpochInfo::default())
    }

    async fn deprovision_node_pool_epoch(&self, _pool: &NodePool, _epoch: i64) -> Result<()> {
        Ok(())
    }

    /// Public ports are served straight from the node ports
    async fn ensure_service_address_load_balancer(
        &self,
        _address: &Address,
        target: &LoadBalancerTarget,
    ) -> Result<LoadBalancerInfo> {
        let ports = target
            .ports
            .iter()
            .map(|(port, node_port)| {
                let protocol = target.protocols.get(port).copied().unwrap_or_default();
                (
                    *port,
                    port_url(protocol, &self.options.cluster_ip, *node_port),
                )
            })
            .collect();
        Ok(LoadBalancerInfo {
            annotations: BTreeMap::new(),
            ports,
        })
    }

    async fn destroy_service_address_load_balancer(&self, _address: &Address) -> Result<()> {
        Ok(())
    }

    async fn ensure_dns_record(&self, _record: &DnsRecord) -> Result<()> {
        Ok(())
    }

    async fn destroy_dns_record(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Nodes are not labeled per pool locally, so drop the pool affinity
    fn transform_workload_spec(&self, spec: &mut WorkloadSpec) {
        spec.node_selector.clear();
        spec.tolerations.clear();
    }
}
