//! MetalMachine CRD
//!
//! Binds one cluster-api machine to a physical server from the inventory.

use crate::references::ObjectRef;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.metalstack.io",
    version = "v1alpha3",
    kind = "MetalMachine",
    namespaced,
    status = "MetalMachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineSpec {
    /// Reference to the physical server backing this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ref: Option<ObjectRef>,

    /// Reference to a server class to allocate from when no server is pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_class_ref: Option<ObjectRef>,

    /// Provider ID surfaced to the machine controller once allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

impl MetalMachineSpec {
    /// A machine must name either a concrete server or a server class.
    pub fn has_server_source(&self) -> bool {
        self.server_ref.is_some() || self.server_class_ref.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineStatus {
    /// Whether the backing server is allocated and powered
    pub ready: bool,

    /// Addresses reported for the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,

    /// Error message if reconciliation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address type
    #[serde(rename = "type")]
    pub address_type: MachineAddressType,

    /// The address value
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    /// Hostname of the machine
    Hostname,

    /// Internal (cluster network) IP
    InternalIP,

    /// External (routable) IP
    ExternalIP,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_needs_server_or_class() {
        let neither = MetalMachineSpec {
            server_ref: None,
            server_class_ref: None,
            provider_id: None,
        };
        assert!(!neither.has_server_source());

        let pinned = MetalMachineSpec {
            server_ref: Some(ObjectRef::server("server-0".to_string())),
            server_class_ref: None,
            provider_id: None,
        };
        assert!(pinned.has_server_source());
    }
}
