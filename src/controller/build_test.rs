//! Tests for Build resolution and aggregation

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::ResourceExt;

    use super::super::build::*;
    use crate::crd::{
        Build, BuildSpec, BuildState, BuildStatus, BuildWorkloadStatus, ConfigContainerBuild,
        ContainerBuild, ContainerBuildState,
    };
    use crate::definition::{ContainerBuildSource, GitRepositorySource};
    use crate::testing::{definition, path, service, TestLattice};

    const SYSTEM: &str = "petflix";

    fn progress(state: ContainerBuildState) -> BuildWorkloadStatus {
        BuildWorkloadStatus {
            container_build: "cb".to_string(),
            state,
            image: None,
        }
    }

    async fn create_build(lattice: &TestLattice, name: &str, spec: BuildSpec) {
        let mut build = Build::new(name, spec);
        build.metadata.namespace = Some(lattice.namespace(SYSTEM));
        lattice.store.api::<Build>().create(&build).await.unwrap();
    }

    fn version(v: &str) -> BuildSpec {
        BuildSpec {
            version: Some(v.to_string()),
            path: None,
        }
    }

    async fn build_status(lattice: &TestLattice, name: &str) -> BuildStatus {
        lattice
            .get::<Build>(&lattice.namespace(SYSTEM), name)
            .await
            .unwrap()
            .status
            .unwrap_or_default()
    }

    #[test]
    fn test_container_build_name() {
        let a = container_build_name("b1", "/api");
        assert!(a.starts_with("b1-"));
        assert_eq!(a, container_build_name("b1", "/api"));
        assert_ne!(a, container_build_name("b1", "/web"));
    }

    #[test]
    fn test_aggregate() {
        let mut workloads = BTreeMap::from([
            ("/api".to_string(), progress(ContainerBuildState::Succeeded)),
            ("/web".to_string(), progress(ContainerBuildState::Running)),
        ]);
        assert_eq!(aggregate(&workloads), (BuildState::Running, None));

        workloads.insert("/web".to_string(), progress(ContainerBuildState::Succeeded));
        assert_eq!(aggregate(&workloads), (BuildState::Succeeded, None));

        workloads.insert("/db".to_string(), progress(ContainerBuildState::Failed));
        workloads.insert("/web".to_string(), progress(ContainerBuildState::Failed));
        let (state, message) = aggregate(&workloads);
        assert_eq!(state, BuildState::Failed);
        assert_eq!(message.as_deref(), Some("container builds failed for /db, /web"));
    }

    #[tokio::test]
    async fn test_prebuilt_images_succeed() {
        let lattice = TestLattice::local();
        lattice.define(
            "v1",
            definition(
                &[
                    ("/api", service("api:1", 1, "default")),
                    ("/web", service("web:1", 1, "default")),
                ],
                &[("default", "small", 1)],
            ),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        create_build(&lattice, "b1", version("v1")).await;
        lattice.settle().await.unwrap();

        let status = build_status(&lattice, "b1").await;
        assert_eq!(status.state, BuildState::Succeeded);
        assert_eq!(status.version.as_deref(), Some("v1"));
        assert_eq!(status.definition.unwrap().workloads.len(), 2);
        assert_eq!(status.workloads["/api"].image.as_deref(), Some("api:1"));
        assert_eq!(status.workloads["/web"].image.as_deref(), Some("web:1"));
        assert!(status.completion_timestamp.is_some());

        let children = lattice.list::<ContainerBuild>(&lattice.namespace(SYSTEM)).await;
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|cb| cb.owner_references()[0].name == "b1"));
    }

    #[tokio::test]
    async fn test_git_sources_wait_for_builder_jobs() {
        let lattice = TestLattice::local_with_builds(ConfigContainerBuild {
            builder_image: Some("builder:1".to_string()),
            docker_registry: Some("registry.local".to_string()),
            repository: Some("petflix".to_string()),
        });
        lattice.orchestrator.set_auto_complete_jobs(false);
        let mut api = service("unused", 1, "default");
        api.build = ContainerBuildSource {
            git_repository: Some(GitRepositorySource {
                url: "git://example.com/api.git".to_string(),
                reference: "abc123".to_string(),
            }),
            ..Default::default()
        };
        lattice.define("v1", definition(&[("/api", api)], &[("default", "small", 1)]));
        lattice.create_system(SYSTEM).await.unwrap();
        create_build(&lattice, "b1", version("v1")).await;
        lattice.settle().await.unwrap();

        let status = build_status(&lattice, "b1").await;
        assert_eq!(status.state, BuildState::Running);
        let child = status.workloads["/api"].container_build.clone();
        assert_eq!(child, container_build_name("b1", "/api"));

        lattice
            .orchestrator
            .finish_job(&lattice.namespace(SYSTEM), &child, true);
        lattice.settle().await.unwrap();
        let status = build_status(&lattice, "b1").await;
        assert_eq!(status.state, BuildState::Succeeded);
        assert_eq!(
            status.workloads["/api"].image,
            Some(format!("registry.local/petflix:{child}"))
        );
    }

    #[tokio::test]
    async fn test_unknown_version_fails() {
        let lattice = TestLattice::local();
        lattice.create_system(SYSTEM).await.unwrap();
        create_build(&lattice, "b1", version("v404")).await;
        lattice.settle().await.unwrap();

        let status = build_status(&lattice, "b1").await;
        assert_eq!(status.state, BuildState::Failed);
        assert!(status.message.unwrap().contains("v404"));
        assert!(lattice
            .list::<ContainerBuild>(&lattice.namespace(SYSTEM))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_invalid_definition_fails() {
        let lattice = TestLattice::local();
        lattice.define(
            "v1",
            definition(&[("/api", service("api:1", 1, "undeclared"))], &[]),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        create_build(&lattice, "b1", version("v1")).await;
        lattice.settle().await.unwrap();

        let status = build_status(&lattice, "b1").await;
        assert_eq!(status.state, BuildState::Failed);
        assert!(status.message.unwrap().contains("undeclared"));
    }

    #[tokio::test]
    async fn test_path_build_needs_deployed_version() {
        let lattice = TestLattice::local();
        lattice.create_system(SYSTEM).await.unwrap();
        let spec = BuildSpec {
            version: None,
            path: Some(path("/api")),
        };
        create_build(&lattice, "b1", spec).await;
        lattice.settle().await.unwrap();

        let status = build_status(&lattice, "b1").await;
        assert_eq!(status.state, BuildState::Failed);
        assert!(status.message.unwrap().contains("no deployed version"));
    }

    #[tokio::test]
    async fn test_path_build_resolves_subtree_of_deployed_version() {
        let lattice = TestLattice::local();
        lattice.define(
            "v1",
            definition(
                &[
                    ("/api", service("api:1", 1, "default")),
                    ("/api/admin", service("admin:1", 1, "default")),
                    ("/web", service("web:1", 1, "default")),
                ],
                &[("default", "small", 1)],
            ),
        );
        lattice.create_system(SYSTEM).await.unwrap();
        lattice.deploy_version(SYSTEM, "d1", "v1").await.unwrap();
        lattice.settle().await.unwrap();

        let spec = BuildSpec {
            version: None,
            path: Some(path("/api")),
        };
        create_build(&lattice, "b2", spec).await;
        lattice.settle().await.unwrap();

        let status = build_status(&lattice, "b2").await;
        assert_eq!(status.state, BuildState::Succeeded);
        assert_eq!(status.version.as_deref(), Some("v1"));
        let paths: Vec<&String> = status.workloads.keys().collect();
        assert_eq!(paths, vec!["/api", "/api/admin"]);
    }
}
