//! Lease-based leader election
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease in the lattice's
//! internal namespace runs controllers. Losing the lease cancels the stop
//! token so the process can exit and restart from fresh caches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::meta::FIELD_MANAGER;

pub const LEASE_NAME: &str = "lattice-controller-manager";
pub const LEASE_DURATION_SECS: i32 = 15;
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: impl Into<String>) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity: identity.into(),
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag mirroring whether this process currently holds the lease
    pub fn is_leader(&self) -> Arc<AtomicBool> {
        self.is_leader.clone()
    }

    /// Retry until the lease is acquired. Returns false if `stop` fired first.
    pub async fn acquire(&self, stop: &CancellationToken) -> bool {
        info!(identity = %self.identity, lease = LEASE_NAME, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leadership for lease {}", LEASE_NAME);
                    self.is_leader.store(true, Ordering::Relaxed);
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!("Leader election error: {:?}", e),
            }
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// Renew the lease until `stop` fires. Cancels `stop` if the lease is lost.
    pub async fn hold(self, stop: CancellationToken) {
        let mut last_renewal = Utc::now();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(RENEW_INTERVAL) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Utc::now(),
                Ok(false) => {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                    self.is_leader.store(false, Ordering::Relaxed);
                    stop.cancel();
                    break;
                }
                Err(e) => {
                    warn!("Leader election error: {:?}", e);
                    if is_expired(Some(last_renewal), Some(LEASE_DURATION_SECS), Utc::now()) {
                        warn!("Could not renew lease {} before it expired", LEASE_NAME);
                        self.is_leader.store(false, Ordering::Relaxed);
                        stop.cancel();
                        break;
                    }
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let params = PatchParams::apply(FIELD_MANAGER);

        match self.leases.get_opt(LEASE_NAME).await? {
            Some(existing) => {
                let spec = existing.spec.as_ref();
                let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

                if current_holder == Some(self.identity.as_str()) {
                    let patch = serde_json::json!({
                        "spec": {
                            "renewTime": MicroTime(now),
                            "leaseDurationSeconds": LEASE_DURATION_SECS,
                        }
                    });
                    self.leases
                        .patch(LEASE_NAME, &params, &Patch::Merge(&patch))
                        .await?;
                    return Ok(true);
                }

                let expired = is_expired(
                    spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0),
                    spec.and_then(|s| s.lease_duration_seconds),
                    now,
                );
                if !expired {
                    return Ok(false);
                }

                info!(
                    "Lease held by {:?} has expired, taking over",
                    current_holder
                );
                // Precondition on the observed version so two candidates
                // cannot both take over
                let patch = serde_json::json!({
                    "metadata": {
                        "resourceVersion": existing.metadata.resource_version,
                    },
                    "spec": {
                        "holderIdentity": self.identity,
                        "acquireTime": MicroTime(now),
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                match self
                    .leases
                    .patch(LEASE_NAME, &params, &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e),
                }
            }
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_duration_seconds: Some(LEASE_DURATION_SECS),
                        ..Default::default()
                    }),
                };
                match self.leases.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!("Created lease {} with holder {}", LEASE_NAME, self.identity);
                        Ok(true)
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// A lease with no renewal time counts as expired
fn is_expired(renewed: Option<DateTime<Utc>>, duration_secs: Option<i32>, now: DateTime<Utc>) -> bool {
    renewed.map_or(true, |renewed| {
        let duration = duration_secs.unwrap_or(LEASE_DURATION_SECS);
        now > renewed + chrono::Duration::seconds(i64::from(duration))
    })
}

/// Holder identity: `HOSTNAME` when set, else the machine's host name
pub fn default_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        assert!(is_expired(None, None, now));
        assert!(!is_expired(Some(now - chrono::Duration::seconds(5)), Some(15), now));
        assert!(is_expired(Some(now - chrono::Duration::seconds(16)), Some(15), now));
        assert!(is_expired(Some(now - chrono::Duration::seconds(16)), None, now));
    }

    #[test]
    fn test_default_identity_is_not_empty() {
        assert!(!default_identity().is_empty());
    }
}
