//! Tests for the Deploy lifecycle

#[cfg(test)]
mod tests {
    use super::super::deploy::*;
    use crate::controller::service_name;
    use crate::crd::{
        Build, BuildSpec, Deploy, DeploySpec, DeployState, DeployStatus, NodePool, NodePoolSelection,
        Service, System, SystemState,
    };
    use crate::definition::{ContainerBuildSource, GitRepositorySource};
    use crate::testing::{definition, path, service, TestLattice};

    const SYSTEM: &str = "petflix";

    async fn deploy_status(lattice: &TestLattice, name: &str) -> DeployStatus {
        lattice
            .get::<Deploy>(&lattice.namespace(SYSTEM), name)
            .await
            .unwrap()
            .status
            .unwrap_or_default()
    }

    async fn system_status(lattice: &TestLattice) -> (SystemState, Option<String>) {
        let status = lattice
            .get::<System>(&lattice.namespace(SYSTEM), SYSTEM)
            .await
            .unwrap()
            .status
            .unwrap();
        (status.state, status.version)
    }

    async fn deployed_v1(lattice: &TestLattice) {
        lattice.define(
            "v1",
            definition(
                &[
                    ("/api", service("api:1", 2, "default")),
                    ("/web", service("web:1", 1, "web")),
                ],
                &[("default", "small", 2), ("web", "small", 1)],
            ),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
        lattice.settle().await.unwrap();
    }

    #[test]
    fn test_service_spec_from_workload() {
        let mut workload = service("api:1", 3, "default");
        workload.command = Some(vec!["serve".to_string()]);
        let spec = service_spec(path("/api"), &workload, "registry.local/api:abc".to_string());
        assert_eq!(spec.path, path("/api"));
        assert_eq!(spec.image, "registry.local/api:abc");
        assert_eq!(spec.instances, 3);
        assert_eq!(spec.command, Some(vec!["serve".to_string()]));
        assert_eq!(spec.node_pool.shared.as_deref(), Some("default"));

        workload.node_pool = None;
        let spec = service_spec(path("/api"), &workload, "api:1".to_string());
        assert_eq!(spec.node_pool, NodePoolSelection::default());
    }

    #[tokio::test]
    async fn test_deploy_rolls_out_version() {
        let lattice = TestLattice::local();
        deployed_v1(&lattice).await;
        let namespace = lattice.namespace(SYSTEM);

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Succeeded);
        assert_eq!(status.build.as_deref(), Some("d1"));
        assert_eq!(status.version.as_deref(), Some("v1"));
        assert!(status.start_timestamp.is_some());
        assert!(status.completion_timestamp.is_some());

        let mut paths: Vec<String> = lattice
            .list::<Service>(&namespace)
            .await
            .iter()
            .map(|s| s.spec.path.to_string())
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["/api", "/web"]);
        assert_eq!(lattice.list::<NodePool>(&namespace).await.len(), 2);
        assert_eq!(lattice.list::<Build>(&namespace).await.len(), 1);

        assert_eq!(system_status(&lattice).await, (SystemState::Stable, Some("v1".to_string())));
    }

    #[tokio::test]
    async fn test_redeploy_removes_obsolete_services_and_pools() {
        let lattice = TestLattice::local();
        deployed_v1(&lattice).await;
        let namespace = lattice.namespace(SYSTEM);
        let web = service_name(&path("/web"));
        assert!(lattice.orchestrator.workload_names(&namespace).contains(&web));

        lattice.define(
            "v2",
            definition(&[("/api", service("api:2", 3, "default"))], &[("default", "small", 2)]),
        );
        lattice.deploy_version(SYSTEM, "d2", "v2").await.unwrap();
        lattice.settle().await.unwrap();

        assert_eq!(deploy_status(&lattice, "d2").await.state, DeployState::Succeeded);
        let services = lattice.list::<Service>(&namespace).await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].spec.image, "api:2");
        assert_eq!(services[0].spec.instances, 3);
        assert!(lattice.get::<NodePool>(&namespace, "web").await.is_none());
        assert!(lattice.get::<NodePool>(&namespace, "default").await.is_some());
        assert!(!lattice.orchestrator.workload_names(&namespace).contains(&web));
        assert_eq!(system_status(&lattice).await, (SystemState::Stable, Some("v2".to_string())));
    }

    #[tokio::test]
    async fn test_path_deploy_needs_a_deployed_version() {
        let lattice = TestLattice::local();
        lattice.create_system(SYSTEM).await.unwrap();
        let spec = DeploySpec {
            path: Some(path("/api")),
            ..Default::default()
        };
        lattice.deploy(SYSTEM, "d1", spec).await.unwrap();
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Failed);
        assert!(status.message.unwrap().contains("no deployed version"));
    }

    #[tokio::test]
    async fn test_invalid_spec_fails() {
        let lattice = TestLattice::local();
        lattice.create_system(SYSTEM).await.unwrap();
        let spec = DeploySpec {
            version: Some("v1".to_string()),
            build: Some("b1".to_string()),
            ..Default::default()
        };
        lattice.deploy(SYSTEM, "d1", spec).await.unwrap();
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Failed);
        assert!(status.message.unwrap().contains("exactly one of"));
    }

    #[tokio::test]
    async fn test_newer_deploy_supersedes_older() {
        let lattice = TestLattice::local();
        lattice.orchestrator.set_auto_rollout(false);
        lattice.define(
            "v1",
            definition(&[("/api", service("api:1", 2, "default"))], &[("default", "small", 2)]),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
        lattice.settle().await.unwrap();
        assert_eq!(deploy_status(&lattice, "d1").await.state, DeployState::InProgress);

        lattice.deploy_version(SYSTEM, "d2", "v1").await.unwrap();
        lattice.settle().await.unwrap();

        let d1 = deploy_status(&lattice, "d1").await;
        assert_eq!(d1.state, DeployState::Failed);
        assert_eq!(d1.message.as_deref(), Some("superseded by Deploy d2"));
        let d2 = deploy_status(&lattice, "d2").await;
        assert_eq!(d2.state, DeployState::InProgress);
        assert_eq!(d2.build.as_deref(), Some("d1"));

        let namespace = lattice.namespace(SYSTEM);
        lattice
            .orchestrator
            .complete_rollout(&namespace, &service_name(&path("/api")));
        lattice.settle().await.unwrap();
        assert_eq!(deploy_status(&lattice, "d2").await.state, DeployState::Succeeded);
        assert_eq!(deploy_status(&lattice, "d1").await.state, DeployState::Failed);
    }

    #[tokio::test]
    async fn test_finished_newer_deploy_still_supersedes_older() {
        let lattice = TestLattice::local();
        lattice.define(
            "v1",
            definition(&[("/api", service("api:1", 1, "default"))], &[("default", "small", 1)]),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        let namespace = lattice.namespace(SYSTEM);
        lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
        let mut d2 = lattice.deploy_version(SYSTEM, "d2", "v404").await.unwrap();
        d2.status = Some(DeployStatus {
            state: DeployState::Failed,
            message: Some("cancelled".to_string()),
            ..Default::default()
        });
        lattice.store.api::<Deploy>().replace_status(&d2).await.unwrap();
        lattice.settle().await.unwrap();

        let d1 = deploy_status(&lattice, "d1").await;
        assert_eq!(d1.state, DeployState::Failed);
        assert_eq!(d1.message.as_deref(), Some("superseded by Deploy d2"));
        assert!(lattice.list::<Service>(&namespace).await.is_empty());
        assert!(lattice.list::<Build>(&namespace).await.is_empty());
    }

    async fn deploy_build(lattice: &TestLattice, deploy: &str, build: &str) {
        let spec = DeploySpec {
            build: Some(build.to_string()),
            ..Default::default()
        };
        lattice.deploy(SYSTEM, deploy, spec).await.unwrap();
    }

    async fn create_build(lattice: &TestLattice, name: &str, spec: BuildSpec) {
        let mut build = Build::new(name, spec);
        build.metadata.namespace = Some(lattice.namespace(SYSTEM));
        lattice.store.api::<Build>().create(&build).await.unwrap();
    }

    #[tokio::test]
    async fn test_deploy_of_missing_build_fails() {
        let lattice = TestLattice::local();
        lattice.create_system(SYSTEM).await.unwrap();
        deploy_build(&lattice, "d1", "b404").await;
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Failed);
        assert_eq!(status.message.as_deref(), Some("build b404 does not exist"));
    }

    #[tokio::test]
    async fn test_deploy_of_partial_build_fails() {
        let lattice = TestLattice::local();
        deployed_v1(&lattice).await;
        create_build(
            &lattice,
            "b-api",
            BuildSpec {
                version: None,
                path: Some(path("/api")),
            },
        )
        .await;
        lattice.settle().await.unwrap();

        deploy_build(&lattice, "d2", "b-api").await;
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d2").await;
        assert_eq!(status.state, DeployState::Failed);
        assert!(status.message.unwrap().contains("only builds /api"));
        let (state, version) = system_status(&lattice).await;
        assert_eq!(state, SystemState::Stable);
        assert_eq!(version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_deploy_of_whole_system_build() {
        let lattice = TestLattice::local();
        lattice.define(
            "v1",
            definition(&[("/api", service("api:1", 1, "default"))], &[("default", "small", 1)]),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        create_build(
            &lattice,
            "b1",
            BuildSpec {
                version: Some("v1".to_string()),
                path: None,
            },
        )
        .await;
        deploy_build(&lattice, "d1", "b1").await;
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Succeeded);
        assert_eq!(status.build.as_deref(), Some("b1"));
        assert_eq!(status.version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_failed_build_fails_deploy() {
        let lattice = TestLattice::local();
        let mut api = service("api:1", 1, "default");
        api.build = ContainerBuildSource {
            git_repository: Some(GitRepositorySource {
                url: "git://example.com/api.git".to_string(),
                reference: "v1.0.0".to_string(),
            }),
            ..Default::default()
        };
        lattice.define("v1", definition(&[("/api", api)], &[("default", "small", 1)]));
        lattice.create_system(SYSTEM).await.unwrap();
        lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Failed);
        assert!(status.message.unwrap().starts_with("build d1 failed"));
        assert!(lattice.list::<Service>(&lattice.namespace(SYSTEM)).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_version_fails_deploy() {
        let lattice = TestLattice::local();
        lattice.create_system(SYSTEM).await.unwrap();
        lattice.deploy_version(SYSTEM, "d1", "v9").await.unwrap();
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Failed);
        assert!(status.message.unwrap().contains("v9"));
    }

    #[tokio::test]
    async fn test_rejected_workload_fails_deploy() {
        let lattice = TestLattice::local();
        lattice.orchestrator.reject_image("api:bad");
        lattice.define(
            "v1",
            definition(&[("/api", service("api:bad", 1, "default"))], &[("default", "small", 1)]),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
        lattice.settle().await.unwrap();

        let status = deploy_status(&lattice, "d1").await;
        assert_eq!(status.state, DeployState::Failed);
        let message = status.message.unwrap();
        assert!(message.starts_with("service /api failed"), "{message}");
        assert!(message.contains("api:bad"));
        assert_eq!(system_status(&lattice).await.0, SystemState::Failed);
    }
}
