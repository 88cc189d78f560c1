//! Lease-based leader election.
//!
//! Multiple manager replicas contend for one coordination Lease; only the
//! holder runs controllers that perform writes. The lease name is fixed so
//! every replica of the same logical controller group contends for the
//! same lease across restarts.
//!
//! Definitive leadership loss is fatal: in-flight reconciliations are
//! cancelled rather than allowed to finish, so a new leader cannot race
//! our writes.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::debug_server::DebugState;
use crate::error::ManagerError;

/// Stable lease identity shared by all replicas of this controller group.
pub const LEASE_NAME: &str = "controller-leader-election-capm";

/// Time before the lease expires if not renewed.
const LEASE_TTL: Duration = Duration::from_secs(15);

/// How often the holder renews the lease.
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive renewal failures tolerated before giving up leadership.
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Contender for the controller-manager lease.
pub struct LeaderElector {
    lease: Arc<LeaseLock>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease", &LEASE_NAME)
            .finish()
    }
}

impl LeaderElector {
    /// Elector for this replica, identified by `holder_id`.
    pub fn new(client: Client, namespace: &str, holder_id: &str) -> Self {
        let lease = LeaseLock::new(
            client,
            namespace,
            LeaseLockParams {
                holder_id: holder_id.to_string(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        );

        Self { lease: Arc::new(lease) }
    }

    /// Block until this replica holds the lease. Non-leaders stay fully
    /// passive here; no controller is registered before this returns.
    pub async fn acquire(&self) {
        info!(lease = LEASE_NAME, "Attempting to acquire leadership");

        loop {
            match self.lease.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(lease = LEASE_NAME, "Leadership acquired");
                    return;
                }
                Ok(_) => {
                    info!(lease = LEASE_NAME, "Another replica holds the lease, waiting");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check leadership, retrying");
                }
            }

            tokio::time::sleep(RENEW_INTERVAL).await;
        }
    }

    /// Spawn the renewal loop. Leadership loss resolves the task with a
    /// fatal error so the supervisor cancels all in-flight work; transient
    /// failures are retried up to [`MAX_RENEWAL_FAILURES`] times. The task
    /// exits cleanly when the shared shutdown signal fires.
    pub fn supervise(
        &self,
        debug_state: Arc<DebugState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), ManagerError>> {
        let lease = Arc::clone(&self.lease);
        debug_state.set_leading(true);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RENEW_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stopping| *stopping) => {
                        return Ok(());
                    }
                    _ = interval.tick() => {}
                }

                match lease.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {
                        consecutive_failures = 0;
                    }
                    Ok(_) => {
                        error!(lease = LEASE_NAME, "Lost leadership to another replica");
                        debug_state.set_leading(false);
                        return Err(ManagerError::Run(
                            "lost leadership to another replica".to_string(),
                        ));
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_RENEWAL_FAILURES {
                            error!(
                                error = %e,
                                attempts = consecutive_failures,
                                "Giving up lease renewal"
                            );
                            debug_state.set_leading(false);
                            return Err(ManagerError::Run(format!(
                                "lease renewal failed {consecutive_failures} times: {e}"
                            )));
                        }
                        warn!(
                            error = %e,
                            attempt = consecutive_failures,
                            "Transient lease renewal failure, will retry"
                        );
                    }
                }
            }
        })
    }

    /// Release the lease on clean shutdown so a standby takes over
    /// immediately instead of waiting for expiry.
    pub async fn step_down(&self) {
        if let Err(e) = self.lease.step_down().await {
            warn!(error = %e, "Failed to release lease on shutdown");
        } else {
            info!(lease = LEASE_NAME, "Lease released");
        }
    }
}

/// Namespace the lease lives in, from the downward API when available.
pub fn lease_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string())
}

/// This replica's identity: pod name when available, hostname otherwise.
pub fn holder_id() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "metal-controller-manager".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_name_is_stable_across_replicas() {
        // Two replicas built from the same configuration must contend for
        // the same lease, not separate ones.
        assert_eq!(LEASE_NAME, "controller-leader-election-capm");
    }

    #[test]
    fn renewal_stays_ahead_of_expiry() {
        assert!(RENEW_INTERVAL < LEASE_TTL);
    }

    #[test]
    fn holder_identity_is_never_empty() {
        assert!(!holder_id().is_empty());
    }
}
