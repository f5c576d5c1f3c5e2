//! End-to-end reconciliation scenarios over the in-memory lattice

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use lattice_controller::crd::{
    Address, AddressState, Build, ConfigContainerBuild, Deploy, DeployState, NodePool,
    NodePoolEpochState, NodePoolStatus, Service, ServiceState, System, SystemState, Teardown,
    TeardownState,
};
use lattice_controller::definition::{ContainerBuildSource, GitRepositorySource};
use lattice_controller::iac::IacOperation;
use lattice_controller::runtime::{Action, Controller, Reconciler, WorkQueue};
use lattice_controller::store::{LatticeResource, ObjectKey, TypedWatchEvent};
use lattice_controller::testing::{definition, public_service, service, TestLattice};
use lattice_controller::Result;

const SYSTEM: &str = "s1";

const CONTROLLERS: &[&str] = &[
    "system",
    "build",
    "container-build",
    "deploy",
    "teardown",
    "service",
    "job",
    "node-pool",
    "address",
];

type Events<K> = BoxStream<'static, Result<TypedWatchEvent<K>>>;

/// Everything the watch has buffered so far
async fn drain<K>(events: &mut Events<K>) -> Vec<K> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(20), events.next()).await
    {
        match event {
            Ok(TypedWatchEvent::Applied(obj)) | Ok(TypedWatchEvent::Deleted(obj)) => seen.push(obj),
            Ok(TypedWatchEvent::Restarted(objs)) => seen.extend(objs),
            Err(_) => {}
        }
    }
    seen
}

/// Objects as they were removed from the store
async fn drain_deleted<K>(events: &mut Events<K>) -> Vec<K> {
    let mut deleted = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(20), events.next()).await
    {
        if let Ok(TypedWatchEvent::Deleted(obj)) = event {
            deleted.push(obj);
        }
    }
    deleted
}

fn git_workload(image_hint: &str) -> lattice_controller::definition::WorkloadDefinition {
    let mut workload = service(image_hint, 2, "default");
    workload.build = ContainerBuildSource {
        git_repository: Some(GitRepositorySource {
            url: "git://x".to_string(),
            reference: "v1".to_string(),
        }),
        ..Default::default()
    };
    workload
}

fn builder_config() -> ConfigContainerBuild {
    ConfigContainerBuild {
        builder_image: Some("builder:1".to_string()),
        docker_registry: Some("registry.local".to_string()),
        repository: Some("s1".to_string()),
    }
}

async fn deploy_state(lattice: &TestLattice, name: &str) -> Option<DeployState> {
    lattice
        .get::<Deploy>(&lattice.namespace(SYSTEM), name)
        .await
        .and_then(|d| d.status)
        .map(|s| s.state)
}

async fn system_state(lattice: &TestLattice) -> SystemState {
    lattice
        .get::<System>(&lattice.namespace(SYSTEM), SYSTEM)
        .await
        .unwrap()
        .status
        .unwrap()
        .state
}

#[tokio::test]
async fn scenario_happy_path_deploy() {
    let lattice = TestLattice::local_with_builds(builder_config());
    lattice.define(
        "v1",
        definition(&[("/api", git_workload("unused"))], &[("default", "small", 2)]),
    );
    lattice.create_system(SYSTEM).await.unwrap();
    lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();

    let mut states = Vec::new();
    for _ in 0..50 {
        let changed = lattice.round().await.unwrap();
        if let Some(state) = deploy_state(&lattice, "d1").await {
            if states.last() != Some(&state) {
                states.push(state);
            }
        }
        if !changed {
            break;
        }
    }
    assert_eq!(
        states,
        vec![
            DeployState::Pending,
            DeployState::Accepted,
            DeployState::InProgress,
            DeployState::Succeeded,
        ]
    );

    let namespace = lattice.namespace(SYSTEM);
    let builds = lattice.list::<Build>(&namespace).await;
    assert_eq!(builds.len(), 1);
    let build_status = builds[0].status.clone().unwrap();
    let child = build_status.workloads["/api"].container_build.clone();
    let built_image = build_status.workloads["/api"].image.clone().unwrap();
    assert_eq!(built_image, format!("registry.local/s1:{child}"));

    let services = lattice.list::<Service>(&namespace).await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].spec.image, built_image);
    assert_eq!(system_state(&lattice).await, SystemState::Stable);
}

#[tokio::test]
async fn scenario_superseded_deploy() {
    let lattice = TestLattice::local_with_builds(builder_config());
    lattice.orchestrator.set_auto_complete_jobs(false);
    lattice.define(
        "v1",
        definition(&[("/api", git_workload("unused"))], &[("default", "small", 2)]),
    );
    lattice.define(
        "v2",
        definition(&[("/api", service("api:2", 2, "default"))], &[("default", "small", 2)]),
    );
    lattice.create_system(SYSTEM).await.unwrap();
    lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
    lattice.settle().await.unwrap();
    assert_eq!(deploy_state(&lattice, "d1").await, Some(DeployState::Pending));

    lattice.deploy_version(SYSTEM, "d2", "v2").await.unwrap();
    lattice.settle().await.unwrap();

    let namespace = lattice.namespace(SYSTEM);
    let d1 = lattice.get::<Deploy>(&namespace, "d1").await.unwrap().status.unwrap();
    assert_eq!(d1.state, DeployState::Failed);
    assert!(d1.message.unwrap().contains("superseded"));

    let builds = lattice.list::<Build>(&namespace).await;
    assert!(builds
        .iter()
        .any(|b| b.spec.version.as_deref() == Some("v2")));
    assert_eq!(deploy_state(&lattice, "d2").await, Some(DeployState::Succeeded));
}

#[tokio::test]
async fn scenario_node_pool_instance_type_change() {
    let lattice = TestLattice::aws();
    let namespace = lattice.namespace(SYSTEM);
    lattice
        .create_node_pool(SYSTEM, "np1", "small", 3)
        .await
        .unwrap();
    lattice.settle().await.unwrap();
    let pool = lattice.get::<NodePool>(&namespace, "np1").await.unwrap();
    assert_eq!(pool.status.unwrap().epochs.keys().copied().collect::<Vec<_>>(), vec![1]);

    let mut events = lattice.store.api::<NodePool>().watch(Some(&namespace));
    lattice
        .update::<NodePool, _>(&namespace, "np1", |pool| {
            pool.spec.instance_type = "large".to_string();
        })
        .await
        .unwrap();
    lattice.settle().await.unwrap();

    let history: Vec<NodePoolStatus> = drain(&mut events)
        .await
        .into_iter()
        .filter_map(|pool| pool.status)
        .collect();
    assert!(history.iter().any(|s| s
        .epochs
        .get(&2)
        .is_some_and(|e| e.state == NodePoolEpochState::Pending)));
    for status in &history {
        let live = status
            .epochs
            .values()
            .filter(|e| e.state != NodePoolEpochState::Deleting)
            .count();
        assert!(live >= 1, "no live epoch in {status:?}");
        if status.epochs.get(&1).map(|e| e.state) == Some(NodePoolEpochState::Deleting) {
            let next = &status.epochs[&2];
            assert_eq!(next.state, NodePoolEpochState::Stable);
            assert_eq!(next.num_instances, 3);
        }
    }

    let status = lattice
        .get::<NodePool>(&namespace, "np1")
        .await
        .unwrap()
        .status
        .unwrap();
    assert_eq!(status.epochs.keys().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(status.epochs[&2].instance_type, "large");
    assert!(lattice.engine.applied_keys().iter().all(|k| !k.ends_with("@1")));
}

#[tokio::test]
async fn scenario_load_balancer_empty_plan() {
    let lattice = TestLattice::aws();
    let namespace = lattice.namespace(SYSTEM);
    lattice
        .create_node_pool(SYSTEM, "default", "small", 1)
        .await
        .unwrap();
    let name = lattice
        .create_service(SYSTEM, "/a1", &public_service("a1:1", 1, "default", 80))
        .await
        .unwrap()
        .name_any();
    lattice.settle().await.unwrap();

    let before = lattice.get::<Address>(&namespace, &name).await.unwrap();
    assert_eq!(before.status.as_ref().unwrap().state, AddressState::Stable);
    let plans = lattice.engine.count(IacOperation::Plan);
    let applies = lattice.engine.count(IacOperation::Apply);

    lattice.reconcile("address").await.unwrap();

    assert!(lattice.engine.count(IacOperation::Plan) > plans);
    assert_eq!(lattice.engine.count(IacOperation::Apply), applies);
    let after = lattice.get::<Address>(&namespace, &name).await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.resource_version(), before.resource_version());
}

#[tokio::test]
async fn scenario_teardown_cascades() {
    let lattice = TestLattice::aws();
    lattice.define(
        "v1",
        definition(
            &[
                ("/api", public_service("api:1", 1, "default", 80)),
                ("/web", public_service("web:1", 1, "default", 8080)),
                ("/db", service("db:1", 1, "default")),
            ],
            &[("default", "small", 2)],
        ),
    );
    lattice.create_system(SYSTEM).await.unwrap();
    lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
    lattice.settle().await.unwrap();
    let namespace = lattice.namespace(SYSTEM);
    assert_eq!(lattice.list::<Service>(&namespace).await.len(), 3);
    assert_eq!(lattice.list::<Address>(&namespace).await.len(), 3);

    let mut addresses = lattice.store.api::<Address>().watch(Some(&namespace));
    let mut services = lattice.store.api::<Service>().watch(Some(&namespace));
    lattice.teardown(SYSTEM, "t1").await.unwrap();

    // Infrastructure of an Address is gone before the Address is
    for _ in 0..50 {
        let changed = lattice.round().await.unwrap();
        let remaining: Vec<String> = lattice
            .list::<Address>(&namespace)
            .await
            .iter()
            .map(|a| format!("{}.{}", namespace, a.name_any()))
            .collect();
        for key in lattice.engine.applied_keys() {
            if let Some(id) = key.split("service-load-balancer/").nth(1) {
                assert!(remaining.iter().any(|r| r == id), "{key} outlived its address");
            }
        }
        if !changed {
            break;
        }
    }

    assert_eq!(drain_deleted(&mut addresses).await.len(), 3);
    assert_eq!(drain_deleted(&mut services).await.len(), 3);
    let load_balancer_destroys = lattice
        .engine
        .invocations()
        .iter()
        .filter(|i| i.operation == IacOperation::Destroy && i.key.contains("service-load-balancer"))
        .count();
    assert_eq!(load_balancer_destroys, 2);
    assert!(lattice.list::<Service>(&namespace).await.is_empty());
    assert!(lattice.list::<Address>(&namespace).await.is_empty());

    let teardown = lattice.get::<Teardown>(&namespace, "t1").await.unwrap();
    assert_eq!(teardown.status.unwrap().state, TeardownState::Succeeded);
    assert_eq!(system_state(&lattice).await, SystemState::Deleted);
}

#[tokio::test]
async fn scenario_orphan_on_engine_failure() {
    let lattice = TestLattice::aws();
    let namespace = lattice.namespace(SYSTEM);
    lattice
        .create_node_pool(SYSTEM, "np1", "small", 3)
        .await
        .unwrap();
    lattice.settle().await.unwrap();

    lattice
        .engine
        .fail(IacOperation::Destroy, "np1@1", "throttled");
    lattice
        .store
        .api::<NodePool>()
        .delete(&namespace, "np1")
        .await
        .unwrap();
    lattice.settle().await.unwrap();

    let pool = lattice.get::<NodePool>(&namespace, "np1").await.unwrap();
    assert!(!pool.finalizers().is_empty());
    let status = pool.status.unwrap();
    assert_eq!(status.epochs[&1].state, NodePoolEpochState::Deleting);
    assert!(status.message.unwrap().contains("throttled"));
    assert!(lattice.engine.applied_keys().iter().any(|k| k.ends_with("np1@1")));

    lattice.engine.clear_failures();
    lattice.settle().await.unwrap();
    assert!(lattice.get::<NodePool>(&namespace, "np1").await.is_none());
    assert!(lattice.engine.applied_keys().iter().all(|k| !k.contains("np1@")));
}

async fn deployed_lattice() -> TestLattice {
    let lattice = TestLattice::aws();
    lattice.define(
        "v1",
        definition(
            &[
                ("/api", public_service("api:1", 2, "default", 80)),
                ("/db", service("db:1", 1, "default")),
            ],
            &[("default", "small", 2)],
        ),
    );
    lattice.create_system(SYSTEM).await.unwrap();
    lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
    lattice.settle().await.unwrap();
    lattice
}

#[tokio::test]
async fn reconcile_twice_is_a_no_op() {
    let lattice = deployed_lattice().await;
    let version = lattice.memory.resource_version();
    let applies = lattice.engine.count(IacOperation::Apply);
    let destroys = lattice.engine.count(IacOperation::Destroy);
    let workload_applies = lattice.orchestrator.workload_applies();
    let service_applies = lattice.orchestrator.service_applies();

    for controller in CONTROLLERS {
        lattice.reconcile(controller).await.unwrap();
        lattice.reconcile(controller).await.unwrap();
        assert_eq!(lattice.memory.resource_version(), version, "{controller} wrote");
    }
    assert_eq!(lattice.engine.count(IacOperation::Apply), applies);
    assert_eq!(lattice.engine.count(IacOperation::Destroy), destroys);
    assert_eq!(lattice.orchestrator.workload_applies(), workload_applies);
    assert_eq!(lattice.orchestrator.service_applies(), service_applies);
}

#[tokio::test]
async fn status_converges_regardless_of_history() {
    let first = TestLattice::local();
    first
        .create_node_pool(SYSTEM, "default", "small", 2)
        .await
        .unwrap();
    let name = first
        .create_service(SYSTEM, "/api", &public_service("api:1", 2, "default", 80))
        .await
        .unwrap()
        .name_any();
    first.settle().await.unwrap();

    // Same objects, created in the other order with a round in between
    let second = TestLattice::local();
    second
        .create_service(SYSTEM, "/api", &public_service("api:1", 2, "default", 80))
        .await
        .unwrap();
    second.round().await.unwrap();
    second
        .create_node_pool(SYSTEM, "default", "small", 2)
        .await
        .unwrap();
    second.settle().await.unwrap();

    let namespace = first.namespace(SYSTEM);
    let a = first.get::<Service>(&namespace, &name).await.unwrap().status;
    let b = second.get::<Service>(&namespace, &name).await.unwrap().status;
    assert_eq!(a, b);
    assert_eq!(a.unwrap().state, ServiceState::Stable);
    assert_eq!(
        first.get::<NodePool>(&namespace, "default").await.unwrap().status,
        second.get::<NodePool>(&namespace, "default").await.unwrap().status,
    );

    // A scribbled status is recomputed from spec
    let mut svc = second.get::<Service>(&namespace, &name).await.unwrap();
    let status = svc.status.get_or_insert_with(Default::default);
    status.state = ServiceState::Failed;
    status.message = Some("bogus".to_string());
    second.store.api::<Service>().replace_status(&svc).await.unwrap();
    second.settle().await.unwrap();
    let c = second.get::<Service>(&namespace, &name).await.unwrap().status;
    assert_eq!(c.unwrap().state, ServiceState::Stable);
}

/// Records the largest number of concurrent reconciles seen per key
#[derive(Default)]
struct Overlap {
    running: Mutex<BTreeMap<ObjectKey, usize>>,
    worst: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Reconciler for Overlap {
    fn name(&self) -> &'static str {
        "overlap"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let now = {
            let mut running = self.running.lock().unwrap();
            let count = running.entry(key.clone()).or_default();
            *count += 1;
            *count
        };
        self.worst.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        *self.running.lock().unwrap().get_mut(key).unwrap() -= 1;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Action::await_change())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_is_never_reconciled_concurrently() {
    let overlap = Arc::new(Overlap::default());
    let queue = WorkQueue::new("overlap");
    let controller = Controller::new(overlap.clone(), queue.clone());
    let token = CancellationToken::new();
    let run = tokio::spawn(controller.run(8, token.clone()));

    for round in 0..300 {
        queue.add(ObjectKey::new("ns", format!("obj-{}", round % 3)));
        if round % 7 == 0 {
            tokio::task::yield_now().await;
        }
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(queue.is_empty() && queue.in_flight() == 0) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    token.cancel();
    run.await.unwrap();

    assert!(overlap.calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(overlap.worst.load(Ordering::SeqCst), 1);
}

fn finalizers_drained<K: LatticeResource>(removed: &[K]) -> bool {
    removed.iter().all(|obj| obj.finalizers().is_empty())
}

#[tokio::test]
async fn nothing_is_removed_while_finalizers_remain() {
    let lattice = deployed_lattice().await;
    let namespace = lattice.namespace(SYSTEM);
    lattice
        .engine
        .fail(IacOperation::Destroy, "service-load-balancer", "denied");

    let mut addresses = lattice.store.api::<Address>().watch(Some(&namespace));
    let mut services = lattice.store.api::<Service>().watch(Some(&namespace));
    let mut pools = lattice.store.api::<NodePool>().watch(Some(&namespace));
    lattice.teardown(SYSTEM, "t1").await.unwrap();
    lattice.settle().await.unwrap();

    // The public service's address is stuck behind its finalizer
    let stuck: Vec<Address> = lattice.list::<Address>(&namespace).await;
    assert_eq!(stuck.len(), 1);
    assert!(stuck[0].metadata.deletion_timestamp.is_some());
    assert!(!stuck[0].finalizers().is_empty());
    assert_eq!(lattice.list::<Service>(&namespace).await.len(), 1);

    lattice.engine.clear_failures();
    lattice
        .store
        .api::<NodePool>()
        .delete(&namespace, "default")
        .await
        .unwrap();
    lattice.settle().await.unwrap();

    let removed_addresses = drain_deleted(&mut addresses).await;
    let removed_services = drain_deleted(&mut services).await;
    let removed_pools = drain_deleted(&mut pools).await;
    assert_eq!(removed_addresses.len(), 2);
    assert_eq!(removed_services.len(), 2);
    assert_eq!(removed_pools.len(), 1);
    assert!(finalizers_drained(&removed_addresses));
    assert!(finalizers_drained(&removed_services));
    assert!(finalizers_drained(&removed_pools));
}

#[tokio::test]
async fn epochs_stay_dense_and_infrastructure_follows_them() {
    let lattice = TestLattice::aws();
    let namespace = lattice.namespace(SYSTEM);
    lattice
        .create_node_pool(SYSTEM, "np1", "small", 1)
        .await
        .unwrap();
    lattice
        .create_service(SYSTEM, "/api", &service("api:1", 1, "np1"))
        .await
        .unwrap();
    lattice.settle().await.unwrap();
    lattice.orchestrator.set_auto_rollout(false);

    let mut events = lattice.store.api::<NodePool>().watch(Some(&namespace));
    for instance_type in ["medium", "large"] {
        lattice
            .update::<NodePool, _>(&namespace, "np1", |pool| {
                pool.spec.instance_type = instance_type.to_string();
            })
            .await
            .unwrap();
        for _ in 0..20 {
            let changed = lattice.round().await.unwrap();
            let pool = lattice.get::<NodePool>(&namespace, "np1").await.unwrap();
            let epochs = pool.status.clone().unwrap_or_default().epochs;
            for key in lattice.engine.applied_keys() {
                if let Some(epoch) = key.strip_prefix(&format!("lattice/lattice/node-pool/{}@", pool.id())) {
                    let epoch: i64 = epoch.parse().unwrap();
                    assert!(epochs.contains_key(&epoch), "{key} outlived its epoch");
                }
            }
            if !changed {
                break;
            }
        }
    }
    for name in lattice.orchestrator.workload_names(&namespace) {
        lattice.orchestrator.complete_rollout(&namespace, &name);
    }
    lattice.settle().await.unwrap();

    for pool in drain(&mut events).await {
        let Some(status) = pool.status else { continue };
        let keys: Vec<i64> = status.epochs.keys().copied().collect();
        if let (Some(first), Some(last)) = (keys.first(), keys.last()) {
            assert_eq!((last - first + 1) as usize, keys.len(), "gap in {keys:?}");
        }
    }
    let status = lattice
        .get::<NodePool>(&namespace, "np1")
        .await
        .unwrap()
        .status
        .unwrap();
    assert_eq!(status.epochs.keys().copied().collect::<Vec<_>>(), vec![3]);
}

fn load_balancer_applies(lattice: &TestLattice) -> usize {
    lattice
        .engine
        .invocations()
        .iter()
        .filter(|i| i.operation == IacOperation::Apply && i.key.contains("service-load-balancer"))
        .count()
}

#[tokio::test]
async fn load_balancer_applies_follow_non_empty_plans() {
    let lattice = TestLattice::aws();
    let namespace = lattice.namespace(SYSTEM);
    lattice
        .create_node_pool(SYSTEM, "default", "small", 1)
        .await
        .unwrap();
    let name = lattice
        .create_service(SYSTEM, "/api", &public_service("api:1", 1, "default", 80))
        .await
        .unwrap()
        .name_any();
    lattice.settle().await.unwrap();
    lattice
        .update::<Service, _>(&namespace, &name, |svc| svc.spec.ports[0].port = 8080)
        .await
        .unwrap();
    lattice.settle().await.unwrap();
    lattice.settle().await.unwrap();

    let invocations: Vec<_> = lattice
        .engine
        .invocations()
        .into_iter()
        .filter(|i| i.key.contains("service-load-balancer"))
        .collect();
    let applies = load_balancer_applies(&lattice);
    assert_eq!(applies, 2);
    for (i, invocation) in invocations.iter().enumerate() {
        if invocation.operation == IacOperation::Apply {
            let plan = &invocations[i - 1];
            assert_eq!(plan.operation, IacOperation::Plan);
            assert!(!plan.destroy);
            assert_eq!(plan.config, invocation.config);
        }
    }
    // Settled reconciles plan but never apply
    assert!(invocations.len() > 2 * applies);

    // A failing plan fails the reconcile without applying
    lattice
        .engine
        .fail(IacOperation::Plan, "service-load-balancer", "plan exploded");
    lattice
        .update::<Service, _>(&namespace, &name, |svc| svc.spec.ports[0].port = 9090)
        .await
        .unwrap();
    lattice.settle().await.unwrap();
    let address = lattice.get::<Address>(&namespace, &name).await.unwrap();
    let status = address.status.unwrap();
    assert_eq!(status.state, AddressState::Failed);
    assert!(status.failure_info.unwrap().message.contains("plan exploded"));
    assert_eq!(load_balancer_applies(&lattice), applies);
}
