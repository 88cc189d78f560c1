//! ServerBinding CRD
//!
//! Records which physical server from the inventory is bound to which
//! MetalMachine, so allocations survive machine object churn.

use crate::references::ObjectRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "metal.metalstack.io",
    version = "v1alpha1",
    kind = "ServerBinding",
    namespaced,
    status = "ServerBindingStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServerBindingSpec {
    /// The machine this server is bound to
    pub metal_machine_ref: ObjectRef,

    /// Server class the server was allocated from, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_class_ref: Option<ObjectRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerBindingStatus {
    /// Whether the binding is confirmed against the inventory
    pub ready: bool,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,

    /// Error message if reconciliation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
