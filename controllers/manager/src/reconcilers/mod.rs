//! Bounded-concurrency reconcilers.
//!
//! Each reconciler watches one disjoint resource kind through
//! `kube_runtime::Controller` with a shared worker bound. The control
//! loops here only keep status and events current; the provisioning state
//! machines live in their own components.

pub mod cluster;
pub mod machine;
pub mod server_binding;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::ListParams;
use kube::{Api, Client};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{watcher, Controller};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::ManagerError;
use crate::events::Recorder;
use crate::metrics::Metrics;
use crate::registration::MAX_CONCURRENT_RECONCILES;
use crate::scheme::Scheme;

/// Requeue delay after a reconciliation error.
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for all reconcilers.
pub struct ControllerContext {
    /// Kubernetes API client (shared across controllers)
    pub client: Client,
    /// Sealed type registry
    pub scheme: Arc<Scheme>,
    /// Event recorder attributed to this manager
    pub recorder: Recorder,
    /// Process metrics
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext").finish_non_exhaustive()
    }
}

/// Errors surfaced from individual reconciliations. They go back to the
/// controller's requeue policy, never to the process error taxonomy.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Eager registration probe: a controller may only be installed when its
/// CRD is served. Failure aborts the whole startup.
pub async fn ensure_crd_served<K>(client: &Client, name: &str) -> Result<(), ManagerError>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::all(client.clone());
    api.list(&ListParams::default().limit(1))
        .await
        .map_err(|e| ManagerError::registration(name, e))?;
    Ok(())
}

/// Generic controller runner.
///
/// Runs a `kube_runtime::Controller` for one kind until the shared
/// shutdown signal fires: automatic watch reconnection, error requeue
/// with a fixed delay, and the process-wide concurrency bound.
pub(crate) async fn run_controller<K, F>(
    api: Api<K>,
    ctx: Arc<ControllerContext>,
    reconcile_fn: F,
    controller_name: &'static str,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ManagerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(
            Arc<ControllerContext>,
            Arc<K>,
        ) -> Pin<Box<dyn std::future::Future<Output = Result<Action, ReconcileError>> + Send>>
        + Send
        + Sync
        + Clone
        + 'static,
{
    info!(controller = controller_name, "Starting controller");

    let error_policy = {
        let metrics = Arc::clone(&ctx.metrics);
        move |obj: Arc<K>, error: &ReconcileError, _ctx: Arc<ControllerContext>| {
            metrics
                .reconcile_errors
                .with_label_values(&[controller_name])
                .inc();
            error!(
                controller = controller_name,
                object = ?obj.meta().name,
                error = %error,
                "Reconciliation error"
            );
            Action::requeue(ERROR_REQUEUE)
        }
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<ControllerContext>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            debug!(controller = controller_name, object = ?obj.meta().name, "Reconciling");
            ctx.metrics
                .reconciliations
                .with_label_values(&[controller_name])
                .inc();
            reconcile_fn(Arc::clone(&ctx), obj).await
        }
    };

    let mut stop = shutdown;
    let controller_config =
        ControllerConfig::default().concurrency(MAX_CONCURRENT_RECONCILES);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .graceful_shutdown_on(async move {
            let _ = stop.wait_for(|stopping| *stopping).await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!(controller = controller_name, error = %e, "Controller error");
            }
        })
        .await;

    info!(controller = controller_name, "Controller stopped");
    Ok(())
}

/// Merge patch for the shared status shape of the watched kinds.
pub(crate) fn ready_status_patch(ready: bool, error: Option<&str>) -> serde_json::Value {
    json!({
        "status": {
            "ready": ready,
            "lastReconciled": chrono::Utc::now(),
            "error": error,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_patch_carries_ready_flag() {
        let patch = ready_status_patch(true, None);
        assert_eq!(patch["status"]["ready"], json!(true));
        assert_eq!(patch["status"]["error"], json!(null));
        assert!(patch["status"]["lastReconciled"].is_string());
    }

    #[test]
    fn status_patch_carries_error_message() {
        let patch = ready_status_patch(false, Some("no server source"));
        assert_eq!(patch["status"]["ready"], json!(false));
        assert_eq!(patch["status"]["error"], json!("no server source"));
    }
}
