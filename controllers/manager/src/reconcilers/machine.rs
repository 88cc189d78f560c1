//! MetalMachine reconciler.
//!
//! Surfaces whether a machine has a server source and a provider ID. The
//! allocation state machine itself is owned by the provisioning component.

use std::sync::Arc;
use std::time::Duration;

use crds::MetalMachine;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use kube_runtime::controller::Action;
use tokio::sync::watch;

use super::{ready_status_patch, run_controller, ControllerContext, ReconcileError};
use crate::error::ManagerError;

/// Requeue delay while the machine has no server source yet.
const PENDING_REQUEUE: Duration = Duration::from_secs(30);

/// Run the MetalMachine controller until shutdown.
pub async fn run(
    ctx: Arc<ControllerContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ManagerError> {
    let api: Api<MetalMachine> = Api::all(ctx.client.clone());
    run_controller(
        api,
        ctx,
        |ctx, obj| Box::pin(reconcile(ctx, obj)),
        "MetalMachine",
        shutdown,
    )
    .await
}

async fn reconcile(
    ctx: Arc<ControllerContext>,
    machine: Arc<MetalMachine>,
) -> Result<Action, ReconcileError> {
    let ns = machine.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<MetalMachine> = Api::namespaced(ctx.client.clone(), &ns);

    if !machine.spec.has_server_source() {
        ctx.recorder.warning(
            &*machine,
            "NoServerSource",
            "machine names neither a server nor a server class",
        );
        api.patch_status(
            &machine.name_any(),
            &PatchParams::default(),
            &Patch::Merge(ready_status_patch(false, Some("no server source"))),
        )
        .await?;
        return Ok(Action::requeue(PENDING_REQUEUE));
    }

    let allocated = machine.spec.provider_id.is_some();
    api.patch_status(
        &machine.name_any(),
        &PatchParams::default(),
        &Patch::Merge(ready_status_patch(allocated, None)),
    )
    .await?;

    if allocated {
        ctx.recorder
            .normal(&*machine, "Provisioned", "server allocated and provider ID set");
        Ok(Action::await_change())
    } else {
        // Allocation happens elsewhere; check back for the provider ID.
        Ok(Action::requeue(PENDING_REQUEUE))
    }
}
