//! Orchestrator backed by Kubernetes Deployments, Services and Jobs

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job as BatchJob, JobSpec as BatchJobSpecK8s};
use k8s_openapi::api::core::v1::{
    Container as K8sContainer, ContainerPort as K8sContainerPort, EnvVar, HostPathVolumeSource,
    Pod, PodSpec, PodTemplateSpec, ResourceRequirements, Service as K8sService, ServicePort,
    ServiceSpec as K8sServiceSpec, Toleration as K8sToleration, Volume,
    VolumeMount as K8sVolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use super::{
    BatchJobPhase, BatchJobSpec, BatchJobStatus, Container, NetworkServiceKind, NetworkServiceSpec,
    NetworkServiceStatus, ObservedWorkload, Orchestrator, WorkloadSpec, WorkloadStatus,
};
use crate::crd::meta::FIELD_MANAGER;
use crate::crd::Protocol;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

/// 400 and 422 mean the object itself is unacceptable
fn map_apply_error(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => Error::InvalidWorkload {
            name: name.to_string(),
            message: ae.message,
        },
        other => Error::KubeError(other),
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        other => other.map_err(Error::KubeError),
    }
}

fn protocol_name(protocol: Protocol) -> String {
    // Both HTTP and raw TCP ride on TCP
    match protocol {
        Protocol::Http | Protocol::Tcp => "TCP".to_string(),
    }
}

fn build_container(container: &Container) -> K8sContainer {
    let mut requests = BTreeMap::new();
    if let Some(cpu) = &container.resources.cpu {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &container.resources.memory {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }

    K8sContainer {
        name: container.name.clone(),
        image: Some(container.image.clone()),
        command: container.command.clone(),
        args: (!container.args.is_empty()).then(|| container.args.clone()),
        env: Some(
            container
                .env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(
            container
                .ports
                .iter()
                .map(|p| K8sContainerPort {
                    name: Some(p.name.clone()),
                    container_port: p.port,
                    protocol: Some(protocol_name(p.protocol)),
                    ..Default::default()
                })
                .collect(),
        ),
        resources: (!requests.is_empty()).then(|| ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        volume_mounts: (!container.volume_mounts.is_empty()).then(|| {
            container
                .volume_mounts
                .iter()
                .map(|m| K8sVolumeMount {
                    name: m.name.clone(),
                    mount_path: m.mount_path.clone(),
                    ..Default::default()
                })
                .collect()
        }),
        ..Default::default()
    }
}

fn build_deployment(spec: &WorkloadSpec) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            annotations: Some(spec.annotations.clone()),
            owner_references: spec.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(spec.selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(spec.labels.clone()),
                    annotations: Some(spec.annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: spec.containers.iter().map(build_container).collect(),
                    node_selector: (!spec.node_selector.is_empty())
                        .then(|| spec.node_selector.clone()),
                    tolerations: (!spec.tolerations.is_empty()).then(|| {
                        spec.tolerations
                            .iter()
                            .map(|t| K8sToleration {
                                key: Some(t.key.clone()),
                                operator: Some("Equal".to_string()),
                                value: Some(t.value.clone()),
                                effect: Some("NoSchedule".to_string()),
                                ..Default::default()
                            })
                            .collect()
                    }),
                    volumes: (!spec.volumes.is_empty()).then(|| {
                        spec.volumes
                            .iter()
                            .map(|v| Volume {
                                name: v.name.clone(),
                                host_path: Some(HostPathVolumeSource {
                                    path: v.host_path.clone(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            })
                            .collect()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_service(spec: &NetworkServiceSpec) -> K8sService {
    K8sService {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            owner_references: spec.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            type_: Some(
                match spec.kind {
                    NetworkServiceKind::ClusterIp => "ClusterIP",
                    NetworkServiceKind::NodePort => "NodePort",
                }
                .to_string(),
            ),
            selector: Some(spec.selector.clone()),
            ports: Some(
                spec.ports
                    .iter()
                    .map(|p| ServicePort {
                        name: Some(p.name.clone()),
                        port: p.port,
                        target_port: Some(IntOrString::Int(p.target_port)),
                        protocol: Some(protocol_name(p.protocol)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn service_status(service: &K8sService) -> NetworkServiceStatus {
    let node_ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| p.node_port.map(|np| (p.port, np)))
                .collect()
        })
        .unwrap_or_default();
    NetworkServiceStatus { node_ports }
}

fn job_status(job: &BatchJob) -> BatchJobStatus {
    let status = job.status.as_ref();
    let condition = |kind: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == kind && c.status == "True"))
    };
    if condition("Complete").is_some() {
        return BatchJobStatus {
            phase: BatchJobPhase::Succeeded,
            message: None,
        };
    }
    if let Some(failed) = condition("Failed") {
        return BatchJobStatus {
            phase: BatchJobPhase::Failed,
            message: failed.message.clone(),
        };
    }
    let active = status.and_then(|s| s.active).unwrap_or(0);
    BatchJobStatus {
        phase: if active > 0 {
            BatchJobPhase::Running
        } else {
            BatchJobPhase::Pending
        },
        message: None,
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn apply_workload(&self, spec: &WorkloadSpec) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &spec.namespace);
        let deployment = build_deployment(spec);
        api.patch(&spec.name, &Self::apply_params(), &Patch::Apply(&deployment))
            .await
            .map_err(|e| map_apply_error(e, &spec.name))?;
        info!(namespace = %spec.namespace, name = %spec.name, "Applied deployment");
        Ok(())
    }

    async fn workload(&self, namespace: &str, name: &str) -> Result<Option<ObservedWorkload>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let Some(deployment) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let generation = deployment.metadata.generation.unwrap_or(0);
        let spec = deployment.spec.as_ref();
        let status = deployment.status.clone().unwrap_or_default();

        let selector = spec
            .and_then(|s| s.selector.match_labels.as_ref())
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let terminating = pods
            .list(&ListParams::default().labels(&selector))
            .await?
            .items
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_some())
            .count() as i32;

        Ok(Some(ObservedWorkload {
            annotations: deployment.metadata.annotations.clone().unwrap_or_default(),
            status: WorkloadStatus {
                desired: spec.and_then(|s| s.replicas).unwrap_or(1),
                replicas: status.replicas.unwrap_or(0),
                updated: status.updated_replicas.unwrap_or(0),
                available: status.available_replicas.unwrap_or(0),
                terminating,
                current: status.observed_generation.unwrap_or(0) >= generation,
            },
        }))
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        debug!(%namespace, %name, "Deleting deployment");
        ignore_not_found(
            api.delete(name, &DeleteParams::foreground())
                .await
                .map(|_| ()),
        )
    }

    async fn apply_network_service(&self, spec: &NetworkServiceSpec) -> Result<NetworkServiceStatus> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), &spec.namespace);
        let service = build_service(spec);
        let applied = api
            .patch(&spec.name, &Self::apply_params(), &Patch::Apply(&service))
            .await
            .map_err(|e| map_apply_error(e, &spec.name))?;
        Ok(service_status(&applied))
    }

    async fn network_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkServiceStatus>> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(service_status))
    }

    async fn delete_network_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<K8sService> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn apply_batch_job(&self, spec: &BatchJobSpec) -> Result<()> {
        let api: Api<BatchJob> = Api::namespaced(self.client.clone(), &spec.namespace);
        if api.get_opt(&spec.name).await?.is_some() {
            return Ok(());
        }
        let job = BatchJob {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(spec.namespace.clone()),
                labels: Some(spec.labels.clone()),
                owner_references: spec.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            spec: Some(BatchJobSpecK8s {
                backoff_limit: spec.backoff_limit,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(spec.labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![build_container(&spec.container)],
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };
        let params = PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        match api.create(&params, &job).await {
            Ok(_) => {
                info!(namespace = %spec.namespace, name = %spec.name, "Started batch job");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(map_apply_error(e, &spec.name)),
        }
    }

    async fn batch_job(&self, namespace: &str, name: &str) -> Result<Option<BatchJobStatus>> {
        let api: Api<BatchJob> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(job_status))
    }

    async fn delete_batch_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<BatchJob> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(
            api.delete(name, &DeleteParams::background())
                .await
                .map(|_| ()),
        )
    }
}
