//! MetalCluster reconciler.
//!
//! Keeps the cluster infrastructure status current. The actual endpoint
//! provisioning is owned by the cluster state machine component; this loop
//! validates the declared endpoint and surfaces readiness.

use std::sync::Arc;
use std::time::Duration;

use crds::MetalCluster;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use kube_runtime::controller::Action;
use tokio::sync::watch;

use super::{ready_status_patch, run_controller, ControllerContext, ReconcileError};
use crate::error::ManagerError;

/// Requeue delay while the declared endpoint is unusable.
const INVALID_REQUEUE: Duration = Duration::from_secs(30);

/// Run the MetalCluster controller until shutdown.
pub async fn run(
    ctx: Arc<ControllerContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ManagerError> {
    let api: Api<MetalCluster> = Api::all(ctx.client.clone());
    run_controller(
        api,
        ctx,
        |ctx, obj| Box::pin(reconcile(ctx, obj)),
        "MetalCluster",
        shutdown,
    )
    .await
}

async fn reconcile(
    ctx: Arc<ControllerContext>,
    cluster: Arc<MetalCluster>,
) -> Result<Action, ReconcileError> {
    let ns = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<MetalCluster> = Api::namespaced(ctx.client.clone(), &ns);

    if !cluster.spec.control_plane_endpoint.is_valid() {
        ctx.recorder.warning(
            &*cluster,
            "EndpointInvalid",
            "control plane endpoint needs a host and a nonzero port",
        );
        api.patch_status(
            &cluster.name_any(),
            &PatchParams::default(),
            &Patch::Merge(ready_status_patch(false, Some("invalid control plane endpoint"))),
        )
        .await?;
        return Ok(Action::requeue(INVALID_REQUEUE));
    }

    api.patch_status(
        &cluster.name_any(),
        &PatchParams::default(),
        &Patch::Merge(ready_status_patch(true, None)),
    )
    .await?;
    ctx.recorder
        .normal(&*cluster, "Reconciled", "cluster infrastructure ready");

    Ok(Action::await_change())
}
