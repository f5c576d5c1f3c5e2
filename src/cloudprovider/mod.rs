//! Cloud provider abstraction
//!
//! A [`CloudProvider`] turns node pool epochs, service load balancers and
//! DNS records into infrastructure. [`AwsCloudProvider`] drives the IaC
//! engine; [`LocalCloudProvider`] runs everything on the local cluster and
//! provisions nothing.

mod aws;
mod local;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crd::{Address, ConfigCloudProvider, NodePool, NodePoolEpochStatus, Protocol};
use crate::error::{Error, Result};
use crate::iac::IacEngine;
use crate::orchestrator::WorkloadSpec;

pub use aws::{
    AwsCloudProvider, AwsOptions, ANNOTATION_KEY_ADDRESS_LOAD_BALANCER_DNS_NAME,
    ANNOTATION_KEY_NODE_POOL_AUTOSCALING_GROUP_NAME, ANNOTATION_KEY_NODE_POOL_SECURITY_GROUP_ID,
};
pub use local::{LocalCloudProvider, LocalOptions};

/// Facts a provider recorded about one provisioned node pool epoch, keyed
/// by annotation key
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePoolEpochInfo(pub BTreeMap<String, String>);

impl NodePoolEpochInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a service's load balancer must forward to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerTarget {
    /// Public service port to the node port exposing it
    pub ports: BTreeMap<i32, i32>,
    pub protocols: BTreeMap<i32, Protocol>,
    /// Every node pool epoch the service may currently be running on
    pub node_pools: Vec<NodePoolEpochInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerInfo {
    /// Annotations to record on the Address
    pub annotations: BTreeMap<String, String>,
    /// Public port to externally reachable URL
    pub ports: BTreeMap<i32, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsRecordType {
    A,
    Cname,
}

impl DnsRecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            DnsRecordType::A => "A",
            DnsRecordType::Cname => "CNAME",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: DnsRecordType,
    pub value: String,
}

/// Operations the NodePool, Address and Service controllers need from the
/// cloud. Every operation is idempotent.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the pool's spec can no longer be served by its current epoch
    fn node_pool_needs_new_epoch(&self, pool: &NodePool) -> bool;

    /// Create or scale the infrastructure of one epoch. `existing` is what
    /// a previous pass recorded for it.
    async fn provision_node_pool_epoch(
        &self,
        pool: &NodePool,
        epoch: i64,
        params: &NodePoolEpochStatus,
        existing: Option<&NodePoolEpochInfo>,
    ) -> Result<NodePoolEpochInfo>;

    async fn deprovision_node_pool_epoch(&self, pool: &NodePool, epoch: i64) -> Result<()>;

    async fn ensure_service_address_load_balancer(
        &self,
        address: &Address,
        target: &LoadBalancerTarget,
    ) -> Result<LoadBalancerInfo>;

    async fn destroy_service_address_load_balancer(&self, address: &Address) -> Result<()>;

    async fn ensure_dns_record(&self, record: &DnsRecord) -> Result<()>;

    async fn destroy_dns_record(&self, name: &str) -> Result<()>;

    /// Apply provider-specific changes to a Service's desired workload
    fn transform_workload_spec(&self, spec: &mut WorkloadSpec);
}

/// Static provider options; exactly one variant is set
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CloudProviderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalOptions>,
}

impl CloudProviderOptions {
    pub fn provider_name(&self) -> Option<&'static str> {
        match (&self.aws, &self.local) {
            (Some(_), None) => Some("aws"),
            (None, Some(_)) => Some("local"),
            _ => None,
        }
    }

    /// Merge the lattice's Config into the options the process started with.
    /// The Config must carry a block for the same provider.
    pub fn overlay(&self, dynamic: &ConfigCloudProvider) -> Result<Self> {
        match (&self.aws, &self.local) {
            (Some(aws), None) => {
                let config = dynamic.aws.as_ref().ok_or_else(|| {
                    Error::ConfigError(
                        "static options are for aws but the lattice config has no aws block"
                            .to_string(),
                    )
                })?;
                Ok(Self {
                    aws: Some(aws.overlay(config)),
                    local: None,
                })
            }
            (None, Some(local)) => {
                if dynamic.local.is_none() {
                    return Err(Error::ConfigError(
                        "static options are for local but the lattice config has no local block"
                            .to_string(),
                    ));
                }
                Ok(Self {
                    aws: None,
                    local: Some(local.clone()),
                })
            }
            _ => Err(Error::ConfigError(
                "exactly one cloud provider must be configured".to_string(),
            )),
        }
    }
}

/// Build the provider for one lattice
pub fn new_cloud_provider(
    options: &CloudProviderOptions,
    lattice_id: &str,
    engine: Arc<dyn IacEngine>,
) -> Result<Arc<dyn CloudProvider>> {
    match (&options.aws, &options.local) {
        (Some(aws), None) => {
            aws.validate()?;
            Ok(Arc::new(AwsCloudProvider::new(aws.clone(), lattice_id, engine)))
        }
        (None, Some(local)) => Ok(Arc::new(LocalCloudProvider::new(local.clone()))),
        _ => Err(Error::ConfigError(
            "exactly one cloud provider must be configured".to_string(),
        )),
    }
}

/// `scheme://host:port` for a public port
pub(crate) fn port_url(protocol: Protocol, host: &str, port: i32) -> String {
    let scheme = match protocol {
        Protocol::Http => "http",
        Protocol::Tcp => "tcp",
    };
    format!("{scheme}://{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConfigAws, ConfigLocal};

    fn aws_options() -> AwsOptions {
        AwsOptions {
            region: "us-east-1".to_string(),
            account_id: "123456789012".to_string(),
            vpc_id: "vpc-1".to_string(),
            subnet_ids: vec!["subnet-a".to_string()],
            route53_private_zone_id: "Z1".to_string(),
            base_node_ami_id: None,
            key_name: None,
            terraform_module_path: "/etc/terraform/modules".into(),
            terraform_backend: Default::default(),
        }
    }

    #[test]
    fn test_overlay_takes_dynamic_aws_fields() {
        let options = CloudProviderOptions {
            aws: Some(aws_options()),
            local: None,
        };
        let dynamic = ConfigCloudProvider {
            aws: Some(ConfigAws {
                base_node_ami_id: Some("ami-1".to_string()),
                key_name: Some("ops".to_string()),
                subnet_ids: None,
            }),
            local: None,
        };
        let merged = options.overlay(&dynamic).unwrap();
        let aws = merged.aws.unwrap();
        assert_eq!(aws.base_node_ami_id.as_deref(), Some("ami-1"));
        assert_eq!(aws.key_name.as_deref(), Some("ops"));
        assert_eq!(aws.subnet_ids, vec!["subnet-a".to_string()]);
    }

    #[test]
    fn test_overlay_rejects_provider_mismatch() {
        let options = CloudProviderOptions {
            aws: Some(aws_options()),
            local: None,
        };
        let dynamic = ConfigCloudProvider {
            aws: None,
            local: Some(ConfigLocal {}),
        };
        assert!(matches!(
            options.overlay(&dynamic),
            Err(Error::ConfigError(_))
        ));
        assert!(CloudProviderOptions::default()
            .overlay(&dynamic)
            .is_err());
    }

    #[test]
    fn test_port_url() {
        assert_eq!(port_url(Protocol::Http, "lb", 80), "http://lb:80");
        assert_eq!(port_url(Protocol::Tcp, "lb", 5432), "tcp://lb:5432");
    }
}
