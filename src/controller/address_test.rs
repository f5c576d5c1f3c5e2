//! Tests for Address DNS and load balancer management

#[cfg(test)]
mod tests {
    use kube::ResourceExt;

    use super::super::address::*;
    use crate::cloudprovider::ANNOTATION_KEY_ADDRESS_LOAD_BALANCER_DNS_NAME;
    use crate::crd::meta::ADDRESS_FINALIZER;
    use crate::crd::{Address, AddressState, Service, ServiceState};
    use crate::iac::IacOperation;
    use crate::orchestrator::NetworkServiceKind;
    use crate::testing::{path, public_service, service, TestLattice};

    const SYSTEM: &str = "petflix";

    async fn setup(lattice: &TestLattice, public: bool) -> String {
        lattice
            .create_node_pool(SYSTEM, "default", "t3.small", 2)
            .await
            .unwrap();
        let workload = if public {
            public_service("web:1", 2, "default", 80)
        } else {
            service("web:1", 2, "default")
        };
        let svc = lattice
            .create_service(SYSTEM, "/web/frontend", &workload)
            .await
            .unwrap();
        lattice.settle().await.unwrap();
        svc.name_any()
    }

    fn has_key(lattice: &TestLattice, fragment: &str) -> bool {
        lattice.engine.applied_keys().iter().any(|k| k.contains(fragment))
    }

    #[test]
    fn test_names() {
        assert_eq!(
            address_dns_name(&path("/web/frontend"), "petflix", "prod"),
            "frontend.web.petflix.prod.lattice.local"
        );
        assert_eq!(node_port_service_name("api-1a2b"), "load-balancer-address-api-1a2b");
    }

    #[tokio::test]
    async fn test_private_service_gets_dns_only() {
        let lattice = TestLattice::aws();
        let name = setup(&lattice, false).await;
        let namespace = lattice.namespace(SYSTEM);

        let address = lattice.get::<Address>(&namespace, &name).await.unwrap();
        assert!(address.finalizers().contains(&ADDRESS_FINALIZER.to_string()));
        let status = address.status.unwrap();
        assert_eq!(status.state, AddressState::Stable);
        assert!(status.ports.is_empty());
        assert!(has_key(&lattice, "route53"));
        assert!(!has_key(&lattice, "service-load-balancer"));
        assert!(lattice
            .orchestrator
            .network_service_spec(&namespace, &node_port_service_name(&name))
            .is_none());
    }

    #[tokio::test]
    async fn test_local_public_service_exposes_node_port() {
        let lattice = TestLattice::local();
        let name = setup(&lattice, true).await;
        let namespace = lattice.namespace(SYSTEM);

        let address = lattice.get::<Address>(&namespace, &name).await.unwrap();
        let status = address.status.unwrap();
        assert_eq!(status.state, AddressState::Stable);
        assert_eq!(status.ports[&80], "http://127.0.0.1:30000");

        let node_port = lattice
            .orchestrator
            .network_service_spec(&namespace, &node_port_service_name(&name))
            .unwrap();
        assert_eq!(node_port.kind, NetworkServiceKind::NodePort);
        assert_eq!(node_port.owner.unwrap().name, name);

        let svc = lattice.get::<Service>(&namespace, &name).await.unwrap();
        let svc_status = svc.status.unwrap();
        assert_eq!(svc_status.state, ServiceState::Stable);
        assert_eq!(svc_status.ports[&80], "http://127.0.0.1:30000");
    }

    #[tokio::test]
    async fn test_aws_public_service_gets_load_balancer() {
        let lattice = TestLattice::aws();
        let name = setup(&lattice, true).await;
        let namespace = lattice.namespace(SYSTEM);

        let address = lattice.get::<Address>(&namespace, &name).await.unwrap();
        let dns_name = address
            .annotations()
            .get(ANNOTATION_KEY_ADDRESS_LOAD_BALANCER_DNS_NAME)
            .cloned()
            .unwrap();
        assert!(dns_name.ends_with(".elb.local"));
        let status = address.status.unwrap();
        assert_eq!(status.ports[&80], format!("http://{dns_name}:80"));
        assert!(has_key(&lattice, "service-load-balancer"));

        let applies = lattice.engine.count(IacOperation::Apply);
        lattice.settle().await.unwrap();
        assert_eq!(lattice.engine.count(IacOperation::Apply), applies);
    }

    #[tokio::test]
    async fn test_load_balancer_failure_fails_address() {
        let lattice = TestLattice::aws();
        lattice
            .engine
            .fail(IacOperation::Apply, "service-load-balancer", "quota exceeded");
        let name = setup(&lattice, true).await;
        let namespace = lattice.namespace(SYSTEM);

        let status = lattice
            .get::<Address>(&namespace, &name)
            .await
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.state, AddressState::Failed);
        assert!(status.failure_info.unwrap().message.contains("quota exceeded"));

        lattice.engine.clear_failures();
        lattice.settle().await.unwrap();
        let status = lattice
            .get::<Address>(&namespace, &name)
            .await
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.state, AddressState::Stable);
        assert!(status.failure_info.is_none());
    }

    #[tokio::test]
    async fn test_dropping_public_ports_removes_load_balancer() {
        let lattice = TestLattice::aws();
        let name = setup(&lattice, true).await;
        let namespace = lattice.namespace(SYSTEM);
        assert!(has_key(&lattice, "service-load-balancer"));

        lattice
            .update::<Service, _>(&namespace, &name, |svc| {
                for port in &mut svc.spec.ports {
                    port.public = false;
                }
            })
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        let status = lattice
            .get::<Address>(&namespace, &name)
            .await
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.state, AddressState::Stable);
        assert!(status.ports.is_empty());
        assert!(!has_key(&lattice, "service-load-balancer"));
        assert!(lattice
            .orchestrator
            .network_service_spec(&namespace, &node_port_service_name(&name))
            .is_none());
    }

    #[tokio::test]
    async fn test_deleted_service_releases_address() {
        let lattice = TestLattice::aws();
        let name = setup(&lattice, true).await;
        let namespace = lattice.namespace(SYSTEM);

        lattice
            .store
            .api::<Service>()
            .delete(&namespace, &name)
            .await
            .unwrap();
        lattice.settle().await.unwrap();

        assert!(lattice.get::<Address>(&namespace, &name).await.is_none());
        assert!(!has_key(&lattice, "service-load-balancer"));
        assert!(!has_key(&lattice, "route53"));
        assert!(has_key(&lattice, "node-pool"));
    }
}
