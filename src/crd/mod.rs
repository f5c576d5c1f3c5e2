//! Custom Resource Definitions for lattice control planes
//!
//! Every kind is namespaced under the `lattice.mlab.com/v1` group. Desired
//! state is written by the lattice API; status is written only by the
//! controllers in this crate.

mod address;
mod build;
mod config;
mod lifecycle;
pub mod meta;
mod node_pool;
mod service;
mod system;
mod types;


pub use address::{Address, AddressSpec, AddressState, AddressStatus};
pub use build::{
    Build, BuildSpec, BuildState, BuildStatus, BuildWorkloadStatus, ContainerBuild,
    ContainerBuildSpec, ContainerBuildState, ContainerBuildStatus,
};
pub use config::{
    Config, ConfigAws, ConfigCloudProvider, ConfigContainerBuild, ConfigEnvoy, ConfigLocal,
    ConfigServiceMesh, ConfigSpec,
};
pub use lifecycle::{
    Deploy, DeploySpec, DeployState, DeployStatus, Teardown, TeardownSpec, TeardownState,
    TeardownStatus,
};
pub use node_pool::{
    NodePool, NodePoolEpochState, NodePoolEpochStatus, NodePoolSpec, NodePoolState,
    NodePoolStatus,
};
pub use service::{
    Job, JobSpec, JobState, JobStatus, Service, ServiceSpec, ServiceState, ServiceStatus,
};
pub use system::{System, SystemServiceSummary, SystemSpec, SystemState, SystemStatus};
pub use types::{
    DedicatedNodePool, FailureInfo, HasStatus, NodePoolAssignments, NodePoolSelection, Protocol,
    ResourceRequests, ServicePort, TreePath,
};

use kube::CustomResourceExt;

/// Every CRD served by a lattice, in install order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        Config::crd(),
        System::crd(),
        Build::crd(),
        ContainerBuild::crd(),
        Deploy::crd(),
        Teardown::crd(),
        Service::crd(),
        Job::crd(),
        NodePool::crd(),
        Address::crd(),
    ]
}
