//! Lattice controller: the reconciliation core of a Lattice control plane.
//!
//! Users declare Systems, Builds, Deploys and Teardowns as custom resources;
//! the controllers in this crate drive them towards running services, node
//! pools and addresses on a container orchestrator, provisioning cloud
//! infrastructure through an IaC engine where a cloud provider requires it.

pub mod cloudprovider;
pub mod config;
pub mod controller;
pub mod crd;
pub mod definition;
pub mod error;
pub mod iac;
pub mod orchestrator;
pub mod runtime;
pub mod servicemesh;
pub mod store;
pub mod telemetry;
pub mod testing;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
