//! Write-once type registry.
//!
//! Maps kind names to API metadata for every type the process reads or
//! writes. The builder is consumed by [`SchemeBuilder::build`], which
//! closes the write window before the manager starts serving: nothing can
//! register types afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::Resource;

/// API coordinates for one registered kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSpec {
    /// API group (empty for the core group)
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind name
    pub kind: String,
    /// Plural resource name
    pub plural: String,
}

impl KindSpec {
    /// `group/version` string, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Accumulates kind registrations before the manager is constructed.
#[derive(Debug, Default)]
pub struct SchemeBuilder {
    kinds: BTreeMap<String, KindSpec>,
}

impl SchemeBuilder {
    /// Start with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single kind. Registration is declarative, so duplicate
    /// registration of the same kind is not an error.
    pub fn register<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let spec = KindSpec {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
        };
        self.kinds.insert(spec.kind.clone(), spec);
        self
    }

    /// Seal the registry. The builder is consumed, so no component can
    /// register types once the manager holds the scheme.
    pub fn build(self) -> Arc<Scheme> {
        Arc::new(Scheme { kinds: self.kinds })
    }
}

/// Read-only registry shared by the recorder, webhooks and controllers.
#[derive(Debug)]
pub struct Scheme {
    kinds: BTreeMap<String, KindSpec>,
}

impl Scheme {
    /// Look up a registered kind.
    pub fn resource(&self, kind: &str) -> Option<&KindSpec> {
        self.kinds.get(kind)
    }

    /// Whether a kind is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

/// Register the infrastructure-provider type group.
pub fn register_infrastructure_types(builder: SchemeBuilder) -> SchemeBuilder {
    builder
        .register::<crds::MetalCluster>()
        .register::<crds::MetalMachine>()
        .register::<crds::MetalMachineTemplate>()
}

/// Register the server inventory type group.
pub fn register_metal_types(builder: SchemeBuilder) -> SchemeBuilder {
    builder.register::<crds::ServerBinding>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_scheme() -> Arc<Scheme> {
        let builder = SchemeBuilder::new();
        let builder = register_infrastructure_types(builder);
        let builder = register_metal_types(builder);
        builder.build()
    }

    #[test]
    fn all_kinds_resolve_after_build() {
        let scheme = full_scheme();
        for kind in ["MetalCluster", "MetalMachine", "MetalMachineTemplate", "ServerBinding"] {
            assert!(scheme.contains(kind), "{kind} missing from scheme");
        }
        assert_eq!(scheme.kinds().count(), 4);
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let builder = register_infrastructure_types(SchemeBuilder::new());
        let builder = register_infrastructure_types(builder);
        let scheme = register_metal_types(builder).build();
        assert_eq!(scheme.kinds().count(), 4);
    }

    #[test]
    fn kind_spec_carries_api_coordinates() {
        let scheme = full_scheme();
        let cluster = scheme.resource("MetalCluster").unwrap();
        assert_eq!(cluster.api_version(), "infrastructure.metalstack.io/v1alpha3");
        assert_eq!(cluster.plural, "metalclusters");

        let binding = scheme.resource("ServerBinding").unwrap();
        assert_eq!(binding.api_version(), "metal.metalstack.io/v1alpha1");
    }

    #[test]
    fn unknown_kind_does_not_resolve() {
        let scheme = full_scheme();
        assert!(scheme.resource("Server").is_none());
    }
}
