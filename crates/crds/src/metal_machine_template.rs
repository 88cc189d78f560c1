//! MetalMachineTemplate CRD
//!
//! Template consumed by machine-deployment style controllers to stamp out
//! MetalMachine objects.

use crate::metal_machine::MetalMachineSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.metalstack.io",
    version = "v1alpha3",
    kind = "MetalMachineTemplate",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineTemplateSpec {
    /// Template for machines created from this template
    pub template: MetalMachineTemplateResource,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineTemplateResource {
    /// Spec each stamped machine starts from
    pub spec: MetalMachineSpec,
}
