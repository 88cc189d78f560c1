//! Manager lifecycle.
//!
//! Exactly one `Manager` exists per process. Construction establishes the
//! cluster connection and binds the metrics listener; `run` performs
//! registration for the selected mode, supervises all background tasks,
//! and blocks until a termination signal drives orderly shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use kube::Client;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{parse_bind_addr, Mode};
use crate::debug_server::DebugState;
use crate::error::ManagerError;
use crate::events::{ClusterSink, EventBroadcaster};
use crate::leader::{holder_id, lease_namespace, LeaderElector};
use crate::metrics::{self, Metrics};
use crate::reconcilers::{self, ensure_crd_served, ControllerContext};
use crate::registration::RegistrationPlan;
use crate::scheme::Scheme;
use crate::webhooks::{self, WebhookState};

/// Component name events are attributed to.
pub const COMPONENT_NAME: &str = "metal-controller-manager";

/// Bounded drain window for in-flight work after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Configuration the manager is constructed from.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Metrics endpoint bind address
    pub metrics_addr: String,
    /// Whether to contend for the leader lease
    pub enable_leader_election: bool,
    /// Selected process role
    pub mode: Mode,
}

/// Whether a supervised task failure takes the process down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskPolicy {
    /// Failure propagates to process exit
    Fatal,
    /// Failure is logged, the process continues
    BestEffort,
}

struct Supervised {
    name: &'static str,
    policy: TaskPolicy,
    handle: JoinHandle<Result<(), ManagerError>>,
}

/// The owning context for one process instance.
pub struct Manager {
    client: Client,
    scheme: Arc<Scheme>,
    broadcaster: EventBroadcaster,
    metrics: Arc<Metrics>,
    metrics_listener: TcpListener,
    debug_state: Arc<DebugState>,
    options: ManagerOptions,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Construct the shared runtime. Connectivity to the cluster and the
    /// metrics bind are verified here so a misconfigured process fails
    /// before anything is registered. Fatal, never retried.
    pub async fn new(
        options: ManagerOptions,
        scheme: Arc<Scheme>,
        broadcaster: EventBroadcaster,
        debug_state: Arc<DebugState>,
    ) -> Result<Self, ManagerError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ManagerError::construction("cluster-client", e))?;

        // Probe the apiserver now: a dead connection must fail construction,
        // not the first watch.
        client
            .apiserver_version()
            .await
            .map_err(|e| ManagerError::construction("cluster-connectivity", e))?;

        let metrics_addr = parse_bind_addr(&options.metrics_addr)?;
        let metrics_listener = TcpListener::bind(metrics_addr)
            .await
            .map_err(|e| ManagerError::construction("metrics-listener", e))?;

        let metrics = Arc::new(
            Metrics::new().map_err(|e| ManagerError::construction("metrics-registry", e))?,
        );

        info!(metrics_addr = %metrics_addr, mode = options.mode.as_str(), "Manager constructed");

        Ok(Self {
            client,
            scheme,
            broadcaster,
            metrics,
            metrics_listener,
            debug_state,
            options,
        })
    }

    /// Register everything the plan names, then block until a termination
    /// signal or a fatal task failure. Registration is all-or-nothing: the
    /// first failure aborts startup.
    pub async fn run(
        self,
        plan: RegistrationPlan,
        sidecar: JoinHandle<Result<(), ManagerError>>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Result<(), ManagerError> {
        let shutdown_rx = shutdown_tx.subscribe();

        // Signal handlers go in before anything can block: a standby
        // replica's normal steady state is waiting in lease acquisition,
        // and it must still honor SIGTERM with a clean exit.
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| ManagerError::Run(format!("failed to install SIGTERM handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| ManagerError::Run(format!("failed to install SIGINT handler: {e}")))?;

        let mut tasks: Vec<Supervised> = Vec::new();

        tasks.push(Supervised {
            name: "debug-server",
            policy: TaskPolicy::Fatal,
            handle: sidecar,
        });

        let metrics_task = tokio::spawn({
            let metrics = Arc::clone(&self.metrics);
            let listener = self.metrics_listener;
            let shutdown = shutdown_rx.clone();
            async move {
                metrics::serve(listener, metrics, shutdown)
                    .await
                    .map_err(|e| ManagerError::Run(format!("metrics endpoint failed: {e}")))
            }
        });
        tasks.push(Supervised {
            name: "metrics-endpoint",
            policy: TaskPolicy::BestEffort,
            handle: metrics_task,
        });

        let forwarder = self
            .broadcaster
            .start_recording_to_sink(ClusterSink::new(self.client.clone()), shutdown_rx.clone());
        tasks.push(Supervised {
            name: "event-sink-forwarder",
            policy: TaskPolicy::BestEffort,
            handle: tokio::spawn(async move {
                let _ = forwarder.await;
                Ok(())
            }),
        });

        // The webhook server serves on every replica, leader or not:
        // admission requests carry strict deadlines and the Service routes
        // them to any replica, so serving must not wait for the lease.
        if let Mode::Webhook { port } = self.options.mode {
            let listener = webhooks::bind(port).await?;
            for entry in &plan.webhooks {
                info!(webhook = entry.name, path = entry.path, "Registered webhook");
            }
            let state = WebhookState {
                scheme: Arc::clone(&self.scheme),
                metrics: Arc::clone(&self.metrics),
            };
            let shutdown = shutdown_rx.clone();
            tasks.push(Supervised {
                name: "webhook-server",
                policy: TaskPolicy::Fatal,
                handle: tokio::spawn(async move {
                    webhooks::serve(listener, state, shutdown)
                        .await
                        .map_err(|e| ManagerError::Run(format!("webhook server failed: {e}")))
                }),
            });
        }

        // Only the leader runs the write loops; non-leaders wait here with
        // everything above already serving.
        let mut signalled = false;
        let mut elector = None;
        if self.options.enable_leader_election {
            let contender =
                LeaderElector::new(self.client.clone(), &lease_namespace(), &holder_id());
            let acquired = run_until_shutdown(
                contender.acquire(),
                wait_for_termination(&mut sigterm, &mut sigint),
            )
            .await;
            if acquired.is_some() {
                self.metrics.leadership_changes.inc();
                tasks.push(Supervised {
                    name: "leader-election",
                    policy: TaskPolicy::Fatal,
                    handle: contender
                        .supervise(Arc::clone(&self.debug_state), shutdown_rx.clone()),
                });
                elector = Some(contender);
            } else {
                info!("Received termination signal before leadership, shutting down");
                signalled = true;
            }
        }

        if !signalled {
            let ctx = Arc::new(ControllerContext {
                client: self.client.clone(),
                scheme: Arc::clone(&self.scheme),
                recorder: self
                    .broadcaster
                    .recorder(Arc::clone(&self.scheme), COMPONENT_NAME),
                metrics: Arc::clone(&self.metrics),
            });

            for entry in &plan.controllers {
                let handle = match entry.name {
                    "MetalCluster" => {
                        ensure_crd_served::<crds::MetalCluster>(&self.client, entry.name).await?;
                        tokio::spawn(reconcilers::cluster::run(
                            Arc::clone(&ctx),
                            shutdown_rx.clone(),
                        ))
                    }
                    "MetalMachine" => {
                        ensure_crd_served::<crds::MetalMachine>(&self.client, entry.name).await?;
                        tokio::spawn(reconcilers::machine::run(
                            Arc::clone(&ctx),
                            shutdown_rx.clone(),
                        ))
                    }
                    "ServerBinding" => {
                        ensure_crd_served::<crds::ServerBinding>(&self.client, entry.name).await?;
                        tokio::spawn(reconcilers::server_binding::run(
                            Arc::clone(&ctx),
                            shutdown_rx.clone(),
                        ))
                    }
                    other => return Err(ManagerError::registration(other, "unknown controller")),
                };
                info!(
                    controller = entry.name,
                    max_concurrent_reconciles = entry.max_concurrent_reconciles,
                    "Registered controller"
                );
                tasks.push(Supervised {
                    name: entry.name,
                    policy: TaskPolicy::Fatal,
                    handle,
                });
            }
        }

        let mut supervised: FuturesUnordered<_> = tasks
            .into_iter()
            .map(|task| async move { (task.name, task.policy, task.handle.await) })
            .collect();

        let outcome = if signalled {
            Ok(())
        } else {
            info!(mode = self.options.mode.as_str(), "Starting manager");

            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down gracefully");
                        break Ok(());
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT, shutting down gracefully");
                        break Ok(());
                    }
                    Some((name, policy, result)) = supervised.next() => {
                        match flatten(name, result) {
                            Ok(()) if policy == TaskPolicy::Fatal => {
                                break Err(ManagerError::Run(format!("{name} exited unexpectedly")));
                            }
                            Ok(()) => {
                                warn!(task = name, "Background task exited");
                            }
                            Err(e) if policy == TaskPolicy::Fatal => {
                                error!(task = name, error = %e, "Fatal task failure");
                                break Err(e);
                            }
                            Err(e) => {
                                warn!(task = name, error = %e, "Best-effort task failed, continuing");
                            }
                        }
                    }
                }
            }
        };

        // Orderly shutdown: cancel all derived work, release the lease,
        // then wait out the drain window.
        let _ = shutdown_tx.send(true);
        if let Some(elector) = &elector {
            elector.step_down().await;
        }
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while supervised.next().await.is_some() {}
        })
        .await;

        info!("Shutdown complete");
        outcome
    }
}

/// Resolve `fut`, unless `shutdown` completes first.
async fn run_until_shutdown<F, S>(fut: F, shutdown: S) -> Option<F::Output>
where
    F: Future,
    S: Future<Output = ()>,
{
    tokio::select! {
        out = fut => Some(out),
        () = shutdown => None,
    }
}

/// Resolves when a termination signal arrives.
async fn wait_for_termination(sigterm: &mut Signal, sigint: &mut Signal) {
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

/// Collapse join and task errors into one result.
fn flatten(
    name: &'static str,
    result: Result<Result<(), ManagerError>, tokio::task::JoinError>,
) -> Result<(), ManagerError> {
    match result {
        Ok(inner) => inner,
        Err(e) if e.is_panic() => Err(ManagerError::Run(format!("{name} panicked"))),
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ManagerError::Run(format!("{name} task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_preserves_task_errors() {
        let err = flatten("MetalCluster", Ok(Err(ManagerError::registration("MetalCluster", "boom"))));
        assert!(err.is_err());
        assert!(err.unwrap_err().to_string().contains("MetalCluster"));
    }

    #[test]
    fn flatten_passes_clean_exit() {
        assert!(flatten("metrics-endpoint", Ok(Ok(()))).is_ok());
    }

    #[tokio::test]
    async fn startup_wait_yields_to_termination() {
        // A standby replica blocked on lease acquisition must still honor
        // a termination signal and exit cleanly.
        let out = run_until_shutdown(futures::future::pending::<()>(), async {}).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn startup_wait_completes_when_unsignalled() {
        let out = run_until_shutdown(async { 7 }, futures::future::pending()).await;
        assert_eq!(out, Some(7));
    }
}
