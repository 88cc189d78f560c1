//! Mode-dependent registration plan.
//!
//! The full registration set is computed as data before anything touches
//! the cluster: reconcile mode yields exactly the three controllers,
//! webhook mode exactly the four admission handlers. The two sets are
//! disjoint by construction, and registration itself is eager and
//! all-or-nothing.

use crate::config::Mode;

/// Concurrency bound applied to every registered controller. All three
/// reconcilers share this bound; there is no per-controller divergence.
pub const MAX_CONCURRENT_RECONCILES: u16 = 10;

/// One controller to be registered, with its worker bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEntry {
    /// Controller name, used in logs and failure reports
    pub name: &'static str,
    /// Maximum concurrent reconciliations for this controller
    pub max_concurrent_reconciles: u16,
}

/// One admission webhook to be registered. Webhooks are request-scoped,
/// not loop-scoped, so they carry no concurrency bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEntry {
    /// Webhook name, used in logs and failure reports
    pub name: &'static str,
    /// HTTP path the handler is served on
    pub path: &'static str,
}

/// Everything the selected mode will register, created at startup and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct RegistrationPlan {
    /// Controllers to install (reconcile mode only)
    pub controllers: Vec<ControllerEntry>,
    /// Webhooks to install (webhook mode only)
    pub webhooks: Vec<WebhookEntry>,
}

impl RegistrationPlan {
    /// The registration set for one process instance.
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Reconcile => Self {
                controllers: vec![
                    ControllerEntry {
                        name: "MetalCluster",
                        max_concurrent_reconciles: MAX_CONCURRENT_RECONCILES,
                    },
                    ControllerEntry {
                        name: "MetalMachine",
                        max_concurrent_reconciles: MAX_CONCURRENT_RECONCILES,
                    },
                    ControllerEntry {
                        name: "ServerBinding",
                        max_concurrent_reconciles: MAX_CONCURRENT_RECONCILES,
                    },
                ],
                webhooks: Vec::new(),
            },
            Mode::Webhook { .. } => Self {
                controllers: Vec::new(),
                webhooks: vec![
                    WebhookEntry { name: "MetalCluster", path: "/validate-metalcluster" },
                    WebhookEntry { name: "MetalMachine", path: "/validate-metalmachine" },
                    WebhookEntry {
                        name: "MetalMachineTemplate",
                        path: "/validate-metalmachinetemplate",
                    },
                    WebhookEntry { name: "ServerBinding", path: "/validate-serverbinding" },
                ],
            },
        }
    }
}
