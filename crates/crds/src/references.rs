//! Cross-resource object references
//!
//! Standard Kubernetes-style references used by machine and binding kinds
//! to point at servers and machines in other API groups.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Typed reference to another cluster object
///
/// Follows the Kubernetes `TypedLocalObjectReference` pattern with
/// `apiGroup`, `kind`, `name` and an optional `namespace` (defaults to the
/// referencing object's namespace).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// API group of the referenced resource (e.g., "metal.metalstack.io")
    pub api_group: String,

    /// Kind of the referenced resource (e.g., "Server")
    pub kind: String,

    /// Name of the referenced resource
    pub name: String,

    /// Namespace of the referenced resource (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Create a reference in the same namespace as the referencing object.
    pub fn new(api_group: String, kind: String, name: String) -> Self {
        Self {
            api_group,
            kind,
            name,
            namespace: None,
        }
    }

    /// Helper to create a reference to a server inventory object.
    pub fn server(name: String) -> Self {
        Self {
            api_group: crate::METAL_GROUP.to_string(),
            kind: "Server".to_string(),
            name,
            namespace: None,
        }
    }
}
