//! Process configuration.
//!
//! Flags mirror the deployment manifests: a metrics bind address, the
//! leader-election toggle, and the webhook port that doubles as the mode
//! selector. Everything else is fixed at compile time.

use std::net::SocketAddr;

use clap::Parser;

use crate::error::ManagerError;

/// Command-line flags for the controller manager.
#[derive(Debug, Parser)]
#[command(name = "metal-controller-manager", about = "Metalstack infrastructure provider controller manager")]
pub struct Flags {
    /// The address the metric endpoint binds to
    #[arg(long = "metrics-addr", default_value = ":8080")]
    pub metrics_addr: String,

    /// Enable leader election for controller manager. Enabling this will
    /// ensure there is only one active controller manager.
    #[arg(
        long = "enable-leader-election",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_leader_election: bool,

    /// Webhook server port, disabled by default. When enabled, the manager
    /// only answers admission requests, no reconcilers are installed.
    #[arg(long = "webhook-port", default_value_t = 0)]
    pub webhook_port: u16,
}

impl Flags {
    /// The mode this process runs in, derived from the webhook port.
    pub fn mode(&self) -> Mode {
        Mode::from_webhook_port(self.webhook_port)
    }
}

/// The two terminal process roles, selected once at startup.
///
/// Admission must answer within a strict request deadline while
/// reconciliation has none, so the roles run in separate processes that
/// operators scale and fail independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Host the three bounded-concurrency reconcilers.
    Reconcile,
    /// Host the admission webhook server on the given port.
    Webhook {
        /// Port the webhook server binds to
        port: u16,
    },
}

impl Mode {
    /// Port 0 means "webhook server disabled", i.e. reconciliation mode.
    pub fn from_webhook_port(port: u16) -> Self {
        if port == 0 {
            Self::Reconcile
        } else {
            Self::Webhook { port }
        }
    }

    /// Short name used in logs and the debug endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconcile => "reconcile",
            Self::Webhook { .. } => "webhook",
        }
    }
}

/// Parse a bind address, accepting the `:8080` shorthand for "all
/// interfaces" carried over from the deployment manifests.
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr, ManagerError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    full.parse()
        .map_err(|e| ManagerError::construction("metrics-listener", format!("invalid bind address {addr:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_zero_selects_reconcile_mode() {
        assert_eq!(Mode::from_webhook_port(0), Mode::Reconcile);
    }

    #[test]
    fn nonzero_port_selects_webhook_mode() {
        assert_eq!(Mode::from_webhook_port(9443), Mode::Webhook { port: 9443 });
        assert_eq!(Mode::from_webhook_port(1), Mode::Webhook { port: 1 });
        assert_eq!(Mode::from_webhook_port(u16::MAX), Mode::Webhook { port: u16::MAX });
    }

    #[test]
    fn default_flags_match_manifests() {
        let flags = Flags::parse_from(["metal-controller-manager"]);
        assert_eq!(flags.metrics_addr, ":8080");
        assert!(flags.enable_leader_election);
        assert_eq!(flags.webhook_port, 0);
        assert_eq!(flags.mode(), Mode::Reconcile);
    }

    #[test]
    fn webhook_flag_flips_mode() {
        let flags = Flags::parse_from(["metal-controller-manager", "--webhook-port", "9443"]);
        assert_eq!(flags.mode(), Mode::Webhook { port: 9443 });
    }

    #[test]
    fn leader_election_can_be_disabled() {
        let flags =
            Flags::parse_from(["metal-controller-manager", "--enable-leader-election", "false"]);
        assert!(!flags.enable_leader_election);
    }

    #[test]
    fn bind_addr_accepts_colon_shorthand() {
        let addr = parse_bind_addr(":8080").unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:8080");

        let addr = parse_bind_addr("127.0.0.1:9090").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn bind_addr_rejects_garbage() {
        assert!(parse_bind_addr("not-an-address").is_err());
    }
}
