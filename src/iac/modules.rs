//! Inputs of the engine modules the cloud provider instantiates
//!
//! Field names are the module variable names, so these serialize directly
//! into a module block.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

pub const NODE_POOL_MODULE: &str = "node_pool";
pub const LOAD_BALANCER_MODULE: &str = "load_balancer";
pub const ROUTE53_RECORD_MODULE: &str = "route53_record";

pub const OUTPUT_AUTOSCALING_GROUP_NAME: &str = "autoscaling_group_name";
pub const OUTPUT_SECURITY_GROUP_ID: &str = "security_group_id";
pub const OUTPUT_DNS_NAME: &str = "dns_name";

/// Source of a module under the module library root
pub fn module_source(module_path: &Path, provider: &str, module: &str) -> String {
    module_path
        .join(provider)
        .join(module)
        .display()
        .to_string()
}

/// Autoscaling group for one node pool epoch
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodePoolModule {
    pub region: String,
    pub lattice_id: String,
    /// Epoch ID; also the node label value
    pub name: String,
    pub instance_type: String,
    pub num_instances: i32,
    pub ami_id: String,
    pub key_name: String,
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
}

impl NodePoolModule {
    pub const SOURCE: &'static str = "node-pool";
}

/// Load balancer forwarding service ports to node ports on the instances
/// of every autoscaling group the service may be running in
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoadBalancerModule {
    pub region: String,
    pub lattice_id: String,
    pub name: String,
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    /// Service port to node port
    pub ports: BTreeMap<i32, i32>,
    /// Autoscaling group name to its security group ID
    pub autoscaling_groups: BTreeMap<String, String>,
}

impl LoadBalancerModule {
    pub const SOURCE: &'static str = "load-balancer";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Route53RecordModule {
    pub region: String,
    pub zone_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

impl Route53RecordModule {
    pub const SOURCE: &'static str = "route53-record";
}
