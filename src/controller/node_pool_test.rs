//! Tests for NodePool epoch management

#[cfg(test)]
mod tests {
    use kube::ResourceExt;

    use super::super::node_pool::*;
    use crate::cloudprovider::ANNOTATION_KEY_NODE_POOL_AUTOSCALING_GROUP_NAME;
    use crate::controller::service_name;
    use crate::controller::status::epoch_info;
    use crate::crd::meta::NODE_POOL_FINALIZER;
    use crate::crd::{
        NodePool, NodePoolAssignments, NodePoolEpochState, NodePoolState, NodePoolStatus,
        Service, ServiceState,
    };
    use crate::iac::IacOperation;
    use crate::testing::{path, service, TestLattice};

    const SYSTEM: &str = "petflix";

    async fn pool_status(lattice: &TestLattice, name: &str) -> NodePoolStatus {
        lattice
            .get::<NodePool>(&lattice.namespace(SYSTEM), name)
            .await
            .unwrap()
            .status
            .unwrap()
    }

    async fn set_instance_type(lattice: &TestLattice, name: &str, instance_type: &str) {
        let instance_type = instance_type.to_string();
        lattice
            .update::<NodePool, _>(&lattice.namespace(SYSTEM), name, |pool| {
                pool.spec.instance_type = instance_type;
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconciler_name() {
        let lattice = TestLattice::aws();
        let reconciler = NodePoolReconciler::new(lattice.context.clone());
        assert_eq!(crate::runtime::Reconciler::name(&reconciler), "node-pool");
    }

    #[tokio::test]
    async fn test_new_pool_provisions_first_epoch() {
        let lattice = TestLattice::aws();
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        let pool = lattice
            .get::<NodePool>(&lattice.namespace(SYSTEM), "default")
            .await
            .unwrap();
        assert!(pool.finalizers().contains(&NODE_POOL_FINALIZER.to_string()));
        let status = pool.status.clone().unwrap();
        assert_eq!(status.state, NodePoolState::Stable);
        assert_eq!(status.epochs.len(), 1);
        assert_eq!(status.epochs[&1].state, NodePoolEpochState::Stable);
        assert_eq!(status.epochs[&1].instance_type, "t3.small");

        let info = epoch_info(&pool, 1).unwrap().unwrap();
        assert!(info
            .get(ANNOTATION_KEY_NODE_POOL_AUTOSCALING_GROUP_NAME)
            .is_some());
        assert_eq!(lattice.engine.count(IacOperation::Apply), 1);
    }

    #[tokio::test]
    async fn test_unchanged_pool_is_not_reapplied() {
        let lattice = TestLattice::aws();
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        lattice.settle().await.unwrap();
        let applies = lattice.engine.count(IacOperation::Apply);

        lattice.settle().await.unwrap();
        lattice.settle().await.unwrap();
        assert_eq!(lattice.engine.count(IacOperation::Apply), applies);
        assert!(lattice.engine.count(IacOperation::Plan) > applies);
    }

    #[tokio::test]
    async fn test_instance_count_scales_in_place() {
        let lattice = TestLattice::aws();
        let namespace = lattice.namespace(SYSTEM);
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        lattice
            .update::<NodePool, _>(&namespace, "default", |pool| pool.spec.num_instances = 4)
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        let status = pool_status(&lattice, "default").await;
        assert_eq!(status.epochs.len(), 1);
        assert_eq!(status.epochs[&1].num_instances, 4);
        assert_eq!(status.state, NodePoolState::Stable);
        assert_eq!(lattice.engine.count(IacOperation::Apply), 2);
        assert_eq!(lattice.engine.count(IacOperation::Destroy), 0);
    }

    #[tokio::test]
    async fn test_instance_type_change_rolls_to_new_epoch() {
        let lattice = TestLattice::aws();
        let namespace = lattice.namespace(SYSTEM);
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        set_instance_type(&lattice, "default", "t3.large").await;
        lattice.settle().await.unwrap();

        let pool = lattice.get::<NodePool>(&namespace, "default").await.unwrap();
        let status = pool.status.clone().unwrap();
        assert_eq!(status.epochs.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(status.epochs[&2].instance_type, "t3.large");
        assert_eq!(status.state, NodePoolState::Stable);
        assert!(epoch_info(&pool, 1).unwrap().is_none());
        assert!(epoch_info(&pool, 2).unwrap().is_some());
        assert_eq!(lattice.engine.count(IacOperation::Destroy), 1);
    }

    #[tokio::test]
    async fn test_assigned_epoch_survives_until_rollout_completes() {
        let lattice = TestLattice::aws();
        let namespace = lattice.namespace(SYSTEM);
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        lattice
            .create_service(SYSTEM, "/api", &service("api:1", 2, "default"))
            .await
            .unwrap();
        lattice.settle().await.unwrap();
        let name = service_name(&path("/api"));

        lattice.orchestrator.set_auto_rollout(false);
        set_instance_type(&lattice, "default", "t3.large").await;
        lattice.settle().await.unwrap();

        let status = pool_status(&lattice, "default").await;
        assert_eq!(status.epochs.len(), 2);
        assert_eq!(status.state, NodePoolState::Updating);
        let svc = lattice.get::<Service>(&namespace, &name).await.unwrap();
        let assignments =
            NodePoolAssignments::from_annotations(svc.metadata.annotations.as_ref()).unwrap();
        assert_eq!(assignments.epochs(&namespace, "default"), &[1, 2]);
        assert_eq!(svc.status.unwrap().state, ServiceState::Updating);

        lattice.orchestrator.complete_rollout(&namespace, &name);
        lattice.settle().await.unwrap();

        let status = pool_status(&lattice, "default").await;
        assert_eq!(status.epochs.keys().copied().collect::<Vec<_>>(), vec![2]);
        let svc = lattice.get::<Service>(&namespace, &name).await.unwrap();
        let assignments =
            NodePoolAssignments::from_annotations(svc.metadata.annotations.as_ref()).unwrap();
        assert_eq!(assignments.epochs(&namespace, "default"), &[2]);
        assert_eq!(svc.status.unwrap().state, ServiceState::Stable);
    }

    #[tokio::test]
    async fn test_failed_deprovision_keeps_epoch_for_retry() {
        let lattice = TestLattice::aws();
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        lattice
            .engine
            .fail(IacOperation::Destroy, "@1", "access denied");
        set_instance_type(&lattice, "default", "t3.large").await;
        lattice.settle().await.unwrap();

        let status = pool_status(&lattice, "default").await;
        assert_eq!(status.epochs[&1].state, NodePoolEpochState::Deleting);
        assert!(status.message.unwrap().contains("access denied"));
        assert_eq!(lattice.engine.applied_keys().len(), 2);

        lattice.engine.clear_failures();
        lattice.settle().await.unwrap();
        let status = pool_status(&lattice, "default").await;
        assert!(!status.epochs.contains_key(&1));
        assert!(status.message.is_none());
        assert_eq!(lattice.engine.applied_keys().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_pool_waits_for_its_services() {
        let lattice = TestLattice::aws();
        let namespace = lattice.namespace(SYSTEM);
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        lattice
            .create_service(SYSTEM, "/api", &service("api:1", 1, "default"))
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        lattice
            .store
            .api::<NodePool>()
            .delete(&namespace, "default")
            .await
            .unwrap();
        lattice.settle().await.unwrap();
        let status = pool_status(&lattice, "default").await;
        assert_eq!(status.state, NodePoolState::Deleting);
        assert_eq!(lattice.engine.count(IacOperation::Destroy), 0);

        lattice
            .store
            .api::<Service>()
            .delete(&namespace, &service_name(&path("/api")))
            .await
            .unwrap();
        lattice.settle().await.unwrap();
        assert!(lattice.get::<NodePool>(&namespace, "default").await.is_none());
        assert!(lattice.engine.applied_keys().iter().all(|k| !k.contains("node-pool")));
    }
}
