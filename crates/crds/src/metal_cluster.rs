//! MetalCluster CRD
//!
//! Infrastructure-provider view of one workload cluster backed by
//! bare-metal servers.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.metalstack.io",
    version = "v1alpha3",
    kind = "MetalCluster",
    namespaced,
    status = "MetalClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MetalClusterSpec {
    /// Endpoint of the workload cluster's control plane
    pub control_plane_endpoint: ApiEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Hostname or IP of the control plane endpoint
    pub host: String,

    /// Port of the control plane endpoint
    pub port: u16,
}

impl ApiEndpoint {
    /// True when both host and port carry usable values.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetalClusterStatus {
    /// Whether the cluster infrastructure is ready
    pub ready: bool,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,

    /// Error message if reconciliation failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_name_includes_group() {
        let crd = MetalCluster::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("metalclusters.infrastructure.metalstack.io")
        );
    }

    #[test]
    fn endpoint_validity() {
        let valid = ApiEndpoint { host: "cp.example.com".to_string(), port: 6443 };
        assert!(valid.is_valid());

        let no_host = ApiEndpoint { host: String::new(), port: 6443 };
        assert!(!no_host.is_valid());

        let no_port = ApiEndpoint { host: "cp.example.com".to_string(), port: 0 };
        assert!(!no_port.is_valid());
    }
}
