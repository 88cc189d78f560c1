//! Metalstack CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Metalstack
//! infrastructure provider: cluster, machine, machine-template and
//! server-binding descriptors.

pub mod metal_cluster;
pub mod metal_machine;
pub mod metal_machine_template;
pub mod references;
pub mod server_binding;

pub use metal_cluster::*;
pub use metal_machine::*;
pub use metal_machine_template::*;
pub use references::*;
pub use server_binding::*;

/// API group for infrastructure-provider kinds.
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.metalstack.io";

/// API version for infrastructure-provider kinds.
pub const INFRASTRUCTURE_VERSION: &str = "v1alpha3";

/// API group for the server inventory kinds.
pub const METAL_GROUP: &str = "metal.metalstack.io";

/// API version for the server inventory kinds.
pub const METAL_VERSION: &str = "v1alpha1";
