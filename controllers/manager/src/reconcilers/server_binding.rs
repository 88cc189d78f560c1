//! ServerBinding reconciler.
//!
//! Confirms bindings against their machine reference so stale bindings
//! are visible in status. Binding creation and teardown belong to the
//! allocation component.

use std::sync::Arc;
use std::time::Duration;

use crds::ServerBinding;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use kube_runtime::controller::Action;
use tokio::sync::watch;

use super::{ready_status_patch, run_controller, ControllerContext, ReconcileError};
use crate::error::ManagerError;

/// Requeue delay while the binding is incomplete.
const PENDING_REQUEUE: Duration = Duration::from_secs(30);

/// Run the ServerBinding controller until shutdown.
pub async fn run(
    ctx: Arc<ControllerContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ManagerError> {
    let api: Api<ServerBinding> = Api::all(ctx.client.clone());
    run_controller(
        api,
        ctx,
        |ctx, obj| Box::pin(reconcile(ctx, obj)),
        "ServerBinding",
        shutdown,
    )
    .await
}

async fn reconcile(
    ctx: Arc<ControllerContext>,
    binding: Arc<ServerBinding>,
) -> Result<Action, ReconcileError> {
    let ns = binding.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<ServerBinding> = Api::namespaced(ctx.client.clone(), &ns);

    if binding.spec.metal_machine_ref.name.is_empty() {
        ctx.recorder.warning(
            &*binding,
            "MachineRefMissing",
            "binding does not name a machine",
        );
        api.patch_status(
            &binding.name_any(),
            &PatchParams::default(),
            &Patch::Merge(ready_status_patch(false, Some("machine reference missing"))),
        )
        .await?;
        return Ok(Action::requeue(PENDING_REQUEUE));
    }

    api.patch_status(
        &binding.name_any(),
        &PatchParams::default(),
        &Patch::Merge(ready_status_patch(true, None)),
    )
    .await?;
    ctx.recorder
        .normal(&*binding, "Bound", "server binding confirmed");

    Ok(Action::await_change())
}
