//! AWS provider: autoscaling groups, load balancers and Route 53 records,
//! each provisioned through its own IaC engine state

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{
    port_url, CloudProvider, DnsRecord, LoadBalancerInfo, LoadBalancerTarget, NodePoolEpochInfo,
};
use crate::crd::{Address, ConfigAws, NodePool, NodePoolEpochStatus};
use crate::error::{Error, Result};
use crate::iac::modules::{
    module_source, LoadBalancerModule, NodePoolModule, Route53RecordModule, LOAD_BALANCER_MODULE,
    NODE_POOL_MODULE, OUTPUT_AUTOSCALING_GROUP_NAME, OUTPUT_DNS_NAME, OUTPUT_SECURITY_GROUP_ID,
    ROUTE53_RECORD_MODULE,
};
use crate::iac::{BackendConfig, IacConfig, IacEngine, PlanResult, StateKey};
use crate::orchestrator::WorkloadSpec;

pub const ANNOTATION_KEY_NODE_POOL_AUTOSCALING_GROUP_NAME: &str =
    "aws.cloud-provider.lattice.mlab.com/node-pool-autoscaling-group-name";
pub const ANNOTATION_KEY_NODE_POOL_SECURITY_GROUP_ID: &str =
    "aws.cloud-provider.lattice.mlab.com/node-pool-security-group-id";
pub const ANNOTATION_KEY_ADDRESS_LOAD_BALANCER_DNS_NAME: &str =
    "service-load-balancer.address.aws.cloud-provider.lattice.mlab.com/dns-name";

const PROVIDER: &str = "aws";
const DNS_TTL: u32 = 60;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AwsOptions {
    pub region: String,
    #[serde(default)]
    pub account_id: String,
    pub vpc_id: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub route53_private_zone_id: String,
    /// Set from the lattice Config
    #[serde(default)]
    pub base_node_ami_id: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub terraform_module_path: PathBuf,
    #[serde(default)]
    pub terraform_backend: BackendConfig,
}

impl AwsOptions {
    pub fn overlay(&self, config: &ConfigAws) -> Self {
        let mut merged = self.clone();
        if let Some(ami) = &config.base_node_ami_id {
            merged.base_node_ami_id = Some(ami.clone());
        }
        if let Some(key) = &config.key_name {
            merged.key_name = Some(key.clone());
        }
        if let Some(subnets) = &config.subnet_ids {
            merged.subnet_ids = subnets.clone();
        }
        merged
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() || self.vpc_id.is_empty() {
            return Err(Error::ConfigError(
                "aws region and vpc-id are required".to_string(),
            ));
        }
        if self.subnet_ids.is_empty() {
            return Err(Error::ConfigError("aws subnet-ids are required".to_string()));
        }
        if self.terraform_backend.bucket.is_empty() {
            return Err(Error::ConfigError(
                "terraform backend bucket is required for aws".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct AwsCloudProvider {
    options: AwsOptions,
    lattice_id: String,
    engine: Arc<dyn IacEngine>,
}

impl AwsCloudProvider {
    pub fn new(options: AwsOptions, lattice_id: &str, engine: Arc<dyn IacEngine>) -> Self {
        Self {
            options,
            lattice_id: lattice_id.to_string(),
            engine,
        }
    }

    /// Provider and backend blocks; destroys run against this alone
    fn base_config(&self, key: &StateKey) -> IacConfig {
        IacConfig::new()
            .with_provider(PROVIDER, serde_json::json!({ "region": self.options.region }))
            .with_s3_backend(&self.options.terraform_backend, key)
    }

    fn source(&self, module: &str) -> String {
        module_source(&self.options.terraform_module_path, PROVIDER, module)
    }

    /// Plan, then apply only if the plan found changes. Returns whether
    /// anything was applied.
    async fn plan_and_apply(&self, key: &StateKey, config: &IacConfig) -> Result<bool> {
        match self.engine.plan(key, config, false).await? {
            PlanResult::Empty => {
                debug!(state_key = %key, "Plan is empty, skipping apply");
                Ok(false)
            }
            PlanResult::NonEmpty => {
                self.engine.apply(key, config).await?;
                Ok(true)
            }
        }
    }

    fn node_pool_config(
        &self,
        pool: &NodePool,
        epoch: i64,
        params: &NodePoolEpochStatus,
    ) -> Result<(StateKey, IacConfig)> {
        let key = StateKey::node_pool(&self.lattice_id, &pool.id(), epoch);
        let ami_id = self.options.base_node_ami_id.clone().ok_or_else(|| {
            Error::ConfigError("aws base node AMI ID is not configured".to_string())
        })?;
        let module = NodePoolModule {
            region: self.options.region.clone(),
            lattice_id: self.lattice_id.clone(),
            name: pool.epoch_id(epoch),
            instance_type: params.instance_type.clone(),
            num_instances: params.num_instances,
            ami_id,
            key_name: self.options.key_name.clone().unwrap_or_default(),
            vpc_id: self.options.vpc_id.clone(),
            subnet_ids: self.options.subnet_ids.clone(),
        };
        let config = self
            .base_config(&key)
            .with_module(NODE_POOL_MODULE, &self.source(NodePoolModule::SOURCE), &module)?
            .with_output(
                OUTPUT_AUTOSCALING_GROUP_NAME,
                NODE_POOL_MODULE,
                OUTPUT_AUTOSCALING_GROUP_NAME,
            )
            .with_output(
                OUTPUT_SECURITY_GROUP_ID,
                NODE_POOL_MODULE,
                OUTPUT_SECURITY_GROUP_ID,
            );
        Ok((key, config))
    }

    fn address_key(&self, address: &Address) -> StateKey {
        StateKey::address_load_balancer(
            &self.lattice_id,
            &format!(
                "{}.{}",
                address.namespace().unwrap_or_default(),
                address.name_any()
            ),
        )
    }

    fn route53_key(&self, name: &str) -> StateKey {
        StateKey::route53(&self.lattice_id, &self.options.route53_private_zone_id, name)
    }
}

#[async_trait]
impl CloudProvider for AwsCloudProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn node_pool_needs_new_epoch(&self, pool: &NodePool) -> bool {
        match pool.current_epoch().and_then(|e| pool.epoch(e)) {
            None => true,
            Some(current) => current.instance_type != pool.spec.instance_type,
        }
    }

    #[instrument(skip(self, pool, params, existing), fields(node_pool = %pool.id()))]
    async fn provision_node_pool_epoch(
        &self,
        pool: &NodePool,
        epoch: i64,
        params: &NodePoolEpochStatus,
        existing: Option<&NodePoolEpochInfo>,
    ) -> Result<NodePoolEpochInfo> {
        let (key, config) = self.node_pool_config(pool, epoch, params)?;
        let applied = self.plan_and_apply(&key, &config).await?;

        if let Some(existing) = existing {
            let complete = existing.get(ANNOTATION_KEY_NODE_POOL_AUTOSCALING_GROUP_NAME).is_some()
                && existing.get(ANNOTATION_KEY_NODE_POOL_SECURITY_GROUP_ID).is_some();
            if !applied && complete {
                return Ok(existing.clone());
            }
        }

        let outputs = self
            .engine
            .output(
                &key,
                &config,
                &[OUTPUT_AUTOSCALING_GROUP_NAME, OUTPUT_SECURITY_GROUP_ID],
            )
            .await?;
        let mut info = BTreeMap::new();
        for (output, annotation) in [
            (
                OUTPUT_AUTOSCALING_GROUP_NAME,
                ANNOTATION_KEY_NODE_POOL_AUTOSCALING_GROUP_NAME,
            ),
            (
                OUTPUT_SECURITY_GROUP_ID,
                ANNOTATION_KEY_NODE_POOL_SECURITY_GROUP_ID,
            ),
        ] {
            let value = outputs.get(output).cloned().ok_or_else(|| Error::IacError {
                operation: "output".to_string(),
                work_dir: key.path(),
                message: format!("missing output {output}"),
            })?;
            info.insert(annotation.to_string(), value);
        }
        info!(epoch, "Provisioned node pool epoch");
        Ok(NodePoolEpochInfo(info))
    }

    #[instrument(skip(self, pool), fields(node_pool = %pool.id()))]
    async fn deprovision_node_pool_epoch(&self, pool: &NodePool, epoch: i64) -> Result<()> {
        let key = StateKey::node_pool(&self.lattice_id, &pool.id(), epoch);
        self.engine.destroy(&key, &self.base_config(&key)).await?;
        info!(epoch, "Deprovisioned node pool epoch");
        Ok(())
    }

    #[instrument(skip(self, address, target), fields(address = %address.name_any()))]
    async fn ensure_service_address_load_balancer(
        &self,
        address: &Address,
        target: &LoadBalancerTarget,
    ) -> Result<LoadBalancerInfo> {
        let key = self.address_key(address);
        let mut autoscaling_groups = BTreeMap::new();
        for pool in &target.node_pools {
            let group = pool.get(ANNOTATION_KEY_NODE_POOL_AUTOSCALING_GROUP_NAME);
            let security_group = pool.get(ANNOTATION_KEY_NODE_POOL_SECURITY_GROUP_ID);
            if let (Some(group), Some(security_group)) = (group, security_group) {
                autoscaling_groups.insert(group.to_string(), security_group.to_string());
            }
        }
        let module = LoadBalancerModule {
            region: self.options.region.clone(),
            lattice_id: self.lattice_id.clone(),
            name: format!(
                "{}-{}",
                address.namespace().unwrap_or_default(),
                address.name_any()
            ),
            vpc_id: self.options.vpc_id.clone(),
            subnet_ids: self.options.subnet_ids.clone(),
            ports: target.ports.clone(),
            autoscaling_groups,
        };
        let config = self
            .base_config(&key)
            .with_module(
                LOAD_BALANCER_MODULE,
                &self.source(LoadBalancerModule::SOURCE),
                &module,
            )?
            .with_output(OUTPUT_DNS_NAME, LOAD_BALANCER_MODULE, OUTPUT_DNS_NAME);

        let applied = self.plan_and_apply(&key, &config).await?;
        let recorded = address
            .annotations()
            .get(ANNOTATION_KEY_ADDRESS_LOAD_BALANCER_DNS_NAME)
            .cloned();
        let dns_name = match recorded {
            Some(dns_name) if !applied => dns_name,
            _ => self
                .engine
                .output(&key, &config, &[OUTPUT_DNS_NAME])
                .await?
                .remove(OUTPUT_DNS_NAME)
                .ok_or_else(|| Error::IacError {
                    operation: "output".to_string(),
                    work_dir: key.path(),
                    message: format!("missing output {OUTPUT_DNS_NAME}"),
                })?,
        };

        let ports = target
            .ports
            .keys()
            .map(|port| {
                let protocol = target.protocols.get(port).copied().unwrap_or_default();
                (*port, port_url(protocol, &dns_name, *port))
            })
            .collect();
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_KEY_ADDRESS_LOAD_BALANCER_DNS_NAME.to_string(),
            dns_name,
        );
        Ok(LoadBalancerInfo { annotations, ports })
    }

    #[instrument(skip(self, address), fields(address = %address.name_any()))]
    async fn destroy_service_address_load_balancer(&self, address: &Address) -> Result<()> {
        let key = self.address_key(address);
        let config = self.base_config(&key);
        if self.engine.plan(&key, &config, true).await? == PlanResult::Empty {
            return Ok(());
        }
        self.engine.destroy(&key, &config).await
    }

    async fn ensure_dns_record(&self, record: &DnsRecord) -> Result<()> {
        let key = self.route53_key(&record.name);
        let module = Route53RecordModule {
            region: self.options.region.clone(),
            zone_id: self.options.route53_private_zone_id.clone(),
            name: record.name.clone(),
            record_type: record.record_type.as_str().to_string(),
            value: record.value.clone(),
            ttl: DNS_TTL,
        };
        let config = self.base_config(&key).with_module(
            ROUTE53_RECORD_MODULE,
            &self.source(Route53RecordModule::SOURCE),
            &module,
        )?;
        self.plan_and_apply(&key, &config).await?;
        Ok(())
    }

    async fn destroy_dns_record(&self, name: &str) -> Result<()> {
        let key = self.route53_key(name);
        let config = self.base_config(&key);
        if self.engine.plan(&key, &config, true).await? == PlanResult::Empty {
            return Ok(());
        }
        self.engine.destroy(&key, &config).await
    }

    fn transform_workload_spec(&self, _spec: &mut WorkloadSpec) {}
}
