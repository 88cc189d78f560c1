//! Metalstack infrastructure provider controller manager
//!
//! One binary, two mutually exclusive roles selected by `--webhook-port`:
//! - reconcile mode hosts the MetalCluster, MetalMachine and ServerBinding
//!   controllers behind leader election
//! - webhook mode hosts the validating admission server and installs no
//!   reconcilers
//!
//! Any construction, registration or run failure is fatal; the process
//! exits nonzero and the orchestrator restarts it.

mod config;
mod debug_server;
mod error;
mod events;
mod leader;
mod manager;
mod metrics;
mod reconcilers;
mod registration;
mod scheme;
mod webhooks;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Flags;
use crate::debug_server::{DebugState, DEBUG_ADDR};
use crate::events::{CorrelatorOptions, EventBroadcaster, EVENT_BURST_SIZE};
use crate::manager::{Manager, ManagerOptions};
use crate::registration::RegistrationPlan;
use crate::scheme::{register_infrastructure_types, register_metal_types, SchemeBuilder};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        error!(error = ?e, "Failed to install TLS crypto provider");
        return ExitCode::FAILURE;
    }

    let flags = Flags::parse();
    let mode = flags.mode();

    info!(
        mode = mode.as_str(),
        metrics_addr = %flags.metrics_addr,
        leader_election = flags.enable_leader_election,
        "Starting controller manager"
    );

    // All watched kinds are registered up front; the registry is sealed
    // before anything can look types up.
    let scheme = register_metal_types(register_infrastructure_types(SchemeBuilder::new())).build();

    let broadcaster = EventBroadcaster::new(CorrelatorOptions {
        burst_size: EVENT_BURST_SIZE,
        ..CorrelatorOptions::default()
    });

    // Shared shutdown signal for every background listener and loop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The debug sidecar starts before the manager so operators can reach
    // /debug/status even while startup is still in flight.
    let debug_state = Arc::new(DebugState::new(mode.as_str()));
    let sidecar = tokio::spawn(debug_server::run(
        DEBUG_ADDR,
        Arc::clone(&debug_state),
        shutdown_rx,
    ));

    let options = ManagerOptions {
        metrics_addr: flags.metrics_addr,
        enable_leader_election: flags.enable_leader_election,
        mode,
    };

    let mgr = match Manager::new(options, scheme, broadcaster, debug_state).await {
        Ok(mgr) => mgr,
        Err(e) => {
            error!(error = %e, "Unable to construct manager");
            return ExitCode::FAILURE;
        }
    };

    let plan = RegistrationPlan::for_mode(mode);

    match mgr.run(plan, sidecar, shutdown_tx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Manager exited with error");
            ExitCode::FAILURE
        }
    }
}
