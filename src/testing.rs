//! In-process lattice for tests
//!
//! Wires every reconciler to a [`MemoryStore`], a [`MemoryOrchestrator`]
//! and a cloud provider backed by a [`RecordingEngine`], and drives them
//! deterministically: [`TestLattice::settle`] reconciles every object of
//! every kind until a full round leaves the store unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::ObjectMeta;
use tracing::debug;

use crate::cloudprovider::{AwsCloudProvider, AwsOptions, CloudProvider, LocalCloudProvider, LocalOptions};
use crate::config::EnabledControllers;
use crate::controller::{
    controllers, service_name, service_spec, Context, ControllerEntry, DEFAULT_TEARDOWN_TIMEOUT,
};
use crate::crd::meta::system_namespace;
use crate::crd::{
    ConfigContainerBuild, Deploy, DeploySpec, NodePool, NodePoolSelection, NodePoolSpec, Service,
    ServicePort, System, SystemSpec, Teardown, TeardownSpec, TreePath,
};
use crate::definition::{
    ContainerBuildSource, NodePoolDefinition, StaticResolver, SystemDefinition,
    WorkloadDefinition, WorkloadKind,
};
use crate::error::{Error, Result};
use crate::iac::RecordingEngine;
use crate::orchestrator::MemoryOrchestrator;
use crate::runtime::{InformerFactory, WorkQueue};
use crate::servicemesh::{Envoy, EnvoyOptions, ServiceMesh};
use crate::store::{LatticeResource, MemoryStore, Store};

pub const LATTICE_ID: &str = "lattice";
pub const DEFINITION_URL: &str = "git://example.com/petflix.git";

/// Reconcile rounds after which `settle` gives up
const MAX_ROUNDS: usize = 50;

enum Cloud {
    Local,
    Aws,
}

pub struct TestLattice {
    pub lattice_id: String,
    pub memory: MemoryStore,
    pub store: Store,
    pub orchestrator: MemoryOrchestrator,
    pub engine: RecordingEngine,
    pub resolver: Arc<StaticResolver>,
    pub context: Arc<Context>,
    controllers: Vec<ControllerEntry>,
}

impl TestLattice {
    pub fn local() -> Self {
        Self::new(Cloud::Local, ConfigContainerBuild::default(), DEFAULT_TEARDOWN_TIMEOUT)
    }

    pub fn local_with_builds(container_build: ConfigContainerBuild) -> Self {
        Self::new(Cloud::Local, container_build, DEFAULT_TEARDOWN_TIMEOUT)
    }

    /// Local lattice whose Teardowns give up after `timeout`
    pub fn local_with_teardown_timeout(timeout: Duration) -> Self {
        Self::new(Cloud::Local, ConfigContainerBuild::default(), timeout)
    }

    /// AWS cloud provider over the recording engine
    pub fn aws() -> Self {
        Self::new(Cloud::Aws, ConfigContainerBuild::default(), DEFAULT_TEARDOWN_TIMEOUT)
    }

    fn new(cloud: Cloud, container_build: ConfigContainerBuild, teardown_timeout: Duration) -> Self {
        let memory = MemoryStore::new();
        let store = Store::new(Arc::new(memory.clone()));
        let orchestrator = MemoryOrchestrator::new();
        let engine = RecordingEngine::new();
        let resolver = Arc::new(StaticResolver::new());

        let cloud_provider: Arc<dyn CloudProvider> = match cloud {
            Cloud::Local => Arc::new(LocalCloudProvider::new(LocalOptions::default())),
            Cloud::Aws => Arc::new(AwsCloudProvider::new(
                aws_options(),
                LATTICE_ID,
                Arc::new(engine.clone()),
            )),
        };
        let service_mesh: Arc<dyn ServiceMesh> = Arc::new(
            Envoy::new(EnvoyOptions::default()).expect("default envoy options are valid"),
        );

        let context = Arc::new(Context {
            lattice_id: LATTICE_ID.to_string(),
            store: store.clone(),
            informers: Arc::new(InformerFactory::new(store.clone())),
            orchestrator: Arc::new(orchestrator.clone()),
            cloud_provider,
            service_mesh,
            resolver: resolver.clone(),
            container_build,
            teardown_timeout,
        });

        let controllers = controllers(&context, &EnabledControllers::All);
        for entry in &controllers {
            // The queue only keeps the handlers' senders alive; `settle`
            // walks the caches instead.
            entry.wire(&context, &WorkQueue::new(entry.name));
        }

        Self {
            lattice_id: LATTICE_ID.to_string(),
            memory,
            store,
            orchestrator,
            engine,
            resolver,
            context,
            controllers,
        }
    }

    pub fn namespace(&self, system_id: &str) -> String {
        system_namespace(&self.lattice_id, system_id)
    }

    /// Reconcile everything until a round changes nothing. Returns the
    /// number of rounds run.
    pub async fn settle(&self) -> Result<usize> {
        for round in 1..=MAX_ROUNDS {
            if !self.round().await? {
                return Ok(round);
            }
        }
        Err(Error::OrchestratorError(format!(
            "lattice did not settle within {MAX_ROUNDS} rounds"
        )))
    }

    /// Reconcile every cached object once per controller, in dependency
    /// order. Returns whether the store changed.
    pub async fn round(&self) -> Result<bool> {
        let before = self.memory.resource_version();
        for entry in &self.controllers {
            self.reconcile_all(entry).await?;
        }
        Ok(self.memory.resource_version() != before)
    }

    /// Run one controller over every object of its kind
    pub async fn reconcile(&self, controller: &str) -> Result<()> {
        let entry = self
            .controllers
            .iter()
            .find(|entry| entry.name == controller)
            .ok_or_else(|| Error::ConfigError(format!("unknown controller {controller:?}")))?;
        self.reconcile_all(entry).await
    }

    async fn reconcile_all(&self, entry: &ControllerEntry) -> Result<()> {
        self.context.informers.relist_all().await?;
        for key in entry.primary_keys(&self.context) {
            if let Err(e) = entry.reconciler.reconcile(&key).await {
                debug!(controller = entry.name, %key, error = %e, "Reconcile failed");
            }
        }
        Ok(())
    }

    pub async fn get<K: LatticeResource>(&self, namespace: &str, name: &str) -> Option<K> {
        self.store.api::<K>().get(namespace, name).await.ok().flatten()
    }

    pub async fn list<K: LatticeResource>(&self, namespace: &str) -> Vec<K> {
        self.store
            .api::<K>()
            .list(Some(namespace), &Default::default())
            .await
            .unwrap_or_default()
    }

    /// Register `definition` as version `version` of the test System
    pub fn define(&self, version: &str, definition: SystemDefinition) {
        self.resolver.insert(DEFINITION_URL, version, definition);
    }

    pub async fn create_system(&self, system_id: &str) -> Result<System> {
        let system = System {
            metadata: meta(&self.namespace(system_id), system_id),
            spec: SystemSpec {
                definition_url: DEFINITION_URL.to_string(),
            },
            status: None,
        };
        self.store.api::<System>().create(&system).await
    }

    pub async fn deploy(&self, system_id: &str, name: &str, spec: DeploySpec) -> Result<Deploy> {
        let deploy = Deploy {
            metadata: meta(&self.namespace(system_id), name),
            spec,
            status: None,
        };
        self.store.api::<Deploy>().create(&deploy).await
    }

    /// Deploy `version` of the whole System
    pub async fn deploy_version(&self, system_id: &str, name: &str, version: &str) -> Result<Deploy> {
        let spec = DeploySpec {
            version: Some(version.to_string()),
            ..Default::default()
        };
        self.deploy(system_id, name, spec).await
    }

    /// Create the Service for `raw_path` directly, bypassing Deploy
    pub async fn create_service(&self, system_id: &str, raw_path: &str, workload: &WorkloadDefinition) -> Result<Service> {
        let path = path(raw_path);
        let image = workload.build.docker_image.clone().unwrap_or_default();
        let svc = Service {
            metadata: meta(&self.namespace(system_id), &service_name(&path)),
            spec: service_spec(path, workload, image),
            status: None,
        };
        self.store.api::<Service>().create(&svc).await
    }

    pub async fn create_node_pool(
        &self,
        system_id: &str,
        name: &str,
        instance_type: &str,
        num_instances: i32,
    ) -> Result<NodePool> {
        let pool = NodePool {
            metadata: meta(&self.namespace(system_id), name),
            spec: NodePoolSpec {
                instance_type: instance_type.to_string(),
                num_instances,
            },
            status: None,
        };
        self.store.api::<NodePool>().create(&pool).await
    }

    /// Read-modify-write of a stored object
    pub async fn update<K, F>(&self, namespace: &str, name: &str, change: F) -> Result<K>
    where
        K: LatticeResource,
        F: FnOnce(&mut K),
    {
        let api = self.store.api::<K>();
        let mut obj = api.get(namespace, name).await?.ok_or_else(|| Error::NotFound {
            kind: api.kind().to_string(),
            key: format!("{namespace}/{name}"),
        })?;
        change(&mut obj);
        api.replace(&obj).await
    }

    pub async fn teardown(&self, system_id: &str, name: &str) -> Result<Teardown> {
        let teardown = Teardown {
            metadata: meta(&self.namespace(system_id), name),
            spec: TeardownSpec {},
            status: None,
        };
        self.store.api::<Teardown>().create(&teardown).await
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn aws_options() -> AwsOptions {
    AwsOptions {
        region: "us-east-1".to_string(),
        account_id: "123456789012".to_string(),
        vpc_id: "vpc-0a1b2c".to_string(),
        subnet_ids: vec!["subnet-1".to_string(), "subnet-2".to_string()],
        route53_private_zone_id: "Z0PRIVATE".to_string(),
        base_node_ami_id: Some("ami-0base".to_string()),
        key_name: None,
        ..Default::default()
    }
}

/// A Service running a prebuilt `image` on the shared pool `pool`
pub fn service(image: &str, instances: i32, pool: &str) -> WorkloadDefinition {
    WorkloadDefinition {
        kind: WorkloadKind::Service,
        build: ContainerBuildSource {
            docker_image: Some(image.to_string()),
            ..Default::default()
        },
        instances,
        ports: Vec::new(),
        env: BTreeMap::new(),
        command: None,
        resources: Default::default(),
        node_pool: Some(NodePoolSelection {
            shared: Some(pool.to_string()),
            dedicated: None,
        }),
    }
}

/// `service` with one public HTTP port
pub fn public_service(image: &str, instances: i32, pool: &str, port: i32) -> WorkloadDefinition {
    WorkloadDefinition {
        ports: vec![ServicePort {
            name: "http".to_string(),
            port,
            protocol: Default::default(),
            public: true,
        }],
        ..service(image, instances, pool)
    }
}

/// Definition holding `workloads` keyed by path, plus the shared pools
/// `(name, instance type, instances)`
pub fn definition(
    workloads: &[(&str, WorkloadDefinition)],
    pools: &[(&str, &str, i32)],
) -> SystemDefinition {
    SystemDefinition {
        workloads: workloads
            .iter()
            .map(|(path, w)| (path.to_string(), w.clone()))
            .collect(),
        node_pools: pools
            .iter()
            .map(|(name, instance_type, num_instances)| {
                (
                    name.to_string(),
                    NodePoolDefinition {
                        instance_type: instance_type.to_string(),
                        num_instances: *num_instances,
                    },
                )
            })
            .collect(),
    }
}

/// Parse a path known to be valid
pub fn path(raw: &str) -> TreePath {
    TreePath::parse(raw).expect("test paths are valid")
}
