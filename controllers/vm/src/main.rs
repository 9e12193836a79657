//! VM Controller
//!
//! Reconciles VirtualMachine resources into their dependent workloads:
//! - a compute pod running the machine (recreated while action is "start")
//! - an optional browser display proxy (pod + service)
//! - a one-shot migration job when the desired node changes
//!
//! Exactly one replica runs the workers at a time, guarded by a Lease;
//! deletion is gated by a finalizer until every dependent is confirmed
//! gone.

mod backoff;
mod controller;
mod error;
mod leader;
mod migration;
mod queue;
mod reconcile_helpers;
#[cfg(test)]
mod reconcile_helpers_test;
mod reconciler;
mod resources;
#[cfg(test)]
mod test_utils;
mod watcher;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::ControllerConfig;
use crate::leader::LeaseSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting VM Controller");

    let config = ControllerConfig::from_env();
    let lease = LeaseSettings::from_env();
    let probe_addr =
        std::env::var("VMOPS_PROBE_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Bridge interface: {}", config.bridge_iface);
    info!("  Resource limits suppressed: {}", config.no_resource_limits);
    info!("  Lease: {}/{} as {}", lease.namespace, lease.name, lease.identity);

    let client = Client::try_default().await?;

    let ready = Arc::new(AtomicBool::new(false));
    tokio::spawn(serve_probes(probe_addr, Arc::clone(&ready)));

    // Without the lease this replica must not write anything; failure to
    // establish it is fatal.
    let mut election = leader::start(client.clone(), &lease).await?;
    info!("waiting for leadership");
    leader::wait_for_leadership(&mut election.changes).await?;
    info!("leadership acquired");

    let cancel = CancellationToken::new();
    let controller = {
        let cancel = cancel.clone();
        let ready = Arc::clone(&ready);
        tokio::spawn(controller::run(client, config, cancel, ready))
    };

    tokio::select! {
        () = shutdown_signal() => info!("received shutdown signal"),
        () = leader::monitor_leadership(election.changes.clone()) => {
            warn!("leadership lost, stopping workers");
        }
    }

    cancel.cancel();
    controller.await??;
    info!("VM Controller stopped");
    Ok(())
}

/// Liveness and readiness endpoints; ready flips once this replica leads
/// with synced caches.
async fn serve_probes(addr: String, ready: Arc<AtomicBool>) {
    let app = Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route(
            "/readyz",
            get(move || {
                let ready = Arc::clone(&ready);
                async move {
                    if ready.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );

    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!("probe server listening on {addr}");
            if let Err(e) = axum::serve(listener, app).await {
                error!("probe server failed: {e}");
            }
        }
        Err(e) => error!("failed to bind probe server on {addr}: {e}"),
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install SIGINT handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
