//! Tests for Teardown

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::teardown::*;
    use crate::crd::{
        Deploy, DeployState, NodePool, Service, ServiceState, System, SystemState, Teardown,
        TeardownState, TeardownStatus,
    };
    use crate::iac::IacOperation;
    use crate::testing::{definition, public_service, service, TestLattice};

    const SYSTEM: &str = "petflix";

    async fn teardown_status(lattice: &TestLattice, name: &str) -> TeardownStatus {
        lattice
            .get::<Teardown>(&lattice.namespace(SYSTEM), name)
            .await
            .unwrap()
            .status
            .unwrap_or_default()
    }

    async fn deploy_v1(lattice: &TestLattice) {
        lattice.define(
            "v1",
            definition(
                &[
                    ("/api", service("api:1", 2, "default")),
                    ("/web", public_service("web:1", 1, "default", 80)),
                ],
                &[("default", "small", 2)],
            ),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
        lattice.settle().await.unwrap();
    }

    #[test]
    fn test_elapsed_since() {
        assert_eq!(elapsed_since(None), Duration::ZERO);
        assert_eq!(elapsed_since(Some("yesterday")), Duration::ZERO);
        assert!(elapsed_since(Some("2020-01-01T00:00:00Z")) > Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn test_teardown_deletes_every_service() {
        let lattice = TestLattice::local();
        deploy_v1(&lattice).await;
        let namespace = lattice.namespace(SYSTEM);
        assert_eq!(lattice.list::<Service>(&namespace).await.len(), 2);

        lattice.teardown(SYSTEM, "t1").await.unwrap();
        lattice.settle().await.unwrap();

        let status = teardown_status(&lattice, "t1").await;
        assert_eq!(status.state, TeardownState::Succeeded);
        assert!(status.start_timestamp.is_some());
        assert!(status.completion_timestamp.is_some());
        assert!(lattice.list::<Service>(&namespace).await.is_empty());
        assert!(lattice.orchestrator.workload_names(&namespace).is_empty());
        // Node pools outlive a teardown
        assert_eq!(lattice.list::<NodePool>(&namespace).await.len(), 1);

        let system = lattice.get::<System>(&namespace, SYSTEM).await.unwrap();
        assert_eq!(system.status.unwrap().state, SystemState::Deleted);
    }

    #[tokio::test]
    async fn test_teardown_supersedes_running_deploy() {
        let lattice = TestLattice::local();
        lattice.orchestrator.set_auto_rollout(false);
        deploy_v1(&lattice).await;
        let namespace = lattice.namespace(SYSTEM);
        let deploy = lattice.get::<Deploy>(&namespace, "d1").await.unwrap();
        assert_eq!(deploy.status.unwrap().state, DeployState::InProgress);

        lattice.teardown(SYSTEM, "t1").await.unwrap();
        lattice.settle().await.unwrap();

        let deploy = lattice.get::<Deploy>(&namespace, "d1").await.unwrap();
        let status = deploy.status.unwrap();
        assert_eq!(status.state, DeployState::Failed);
        assert_eq!(status.message.as_deref(), Some("superseded by Teardown t1"));
        assert_eq!(teardown_status(&lattice, "t1").await.state, TeardownState::Succeeded);
        assert!(lattice.list::<Service>(&namespace).await.is_empty());
    }

    #[tokio::test]
    async fn test_later_deploy_supersedes_teardown() {
        let lattice = TestLattice::aws();
        deploy_v1(&lattice).await;
        lattice
            .engine
            .fail(IacOperation::Destroy, "service-load-balancer", "access denied");
        lattice.teardown(SYSTEM, "t1").await.unwrap();
        lattice.settle().await.unwrap();
        assert_eq!(teardown_status(&lattice, "t1").await.state, TeardownState::InProgress);

        lattice.deploy_version(SYSTEM, "u1", "v1").await.unwrap();
        lattice.settle().await.unwrap();
        let status = teardown_status(&lattice, "t1").await;
        assert_eq!(status.state, TeardownState::Failed);
        assert_eq!(status.message.as_deref(), Some("superseded by Deploy u1"));
    }

    #[tokio::test]
    async fn test_teardown_times_out_on_stuck_services() {
        let lattice = TestLattice::aws();
        deploy_v1(&lattice).await;
        let namespace = lattice.namespace(SYSTEM);
        lattice
            .engine
            .fail(IacOperation::Destroy, "service-load-balancer", "access denied");

        let mut teardown = lattice.teardown(SYSTEM, "t1").await.unwrap();
        teardown.status = Some(TeardownStatus {
            state: TeardownState::InProgress,
            start_timestamp: Some("2020-01-01T00:00:00Z".to_string()),
            ..Default::default()
        });
        lattice
            .store
            .api::<Teardown>()
            .replace_status(&teardown)
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        let status = teardown_status(&lattice, "t1").await;
        assert_eq!(status.state, TeardownState::Failed);
        let message = status.message.unwrap();
        assert!(message.starts_with("timed out waiting for services to be deleted"), "{message}");
        assert!(message.contains("/web"));

        let remaining = lattice.list::<Service>(&namespace).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status.as_ref().unwrap().state, ServiceState::Deleting);
    }
}
