//! Health, readiness and metrics endpoints of the controller manager

mod handlers;
mod server;

pub use handlers::{HealthResponse, ReadyResponse};
pub use server::{router, run_server, HealthState};
