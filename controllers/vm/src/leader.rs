//! Lease-based leader election.
//!
//! Exactly one controller replica may run the reconciliation workers.
//! A coordination.k8s.io Lease is held under a fixed namespace/name with
//! this process's pod name (or hostname) as holder identity; losing the
//! lease stops the workers. Failing to establish the lease manager at all
//! is fatal — running unelected would mean two writers.

use std::env;

use kube::Client;
use kube_lease_manager::LeaseManagerBuilder;
use tokio::sync::watch;

use crate::error::ControllerError;

/// Lease duration; the lock is lost if not renewed within this window.
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

/// Seconds before expiry at which renewal happens, i.e. renewal is due
/// ten seconds into the fifteen-second lease.
pub const DEFAULT_LEASE_GRACE_SECS: u64 = 5;

/// Leader-election settings, loaded from the environment with defaults.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Lease object name
    pub name: String,
    /// Namespace the lease lives in
    pub namespace: String,
    /// Holder identity of this replica
    pub identity: String,
    /// Lease duration in seconds
    pub duration_secs: u64,
    /// Renewal grace period in seconds
    pub grace_secs: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            name: "vm-controller".to_string(),
            namespace: "vmops-system".to_string(),
            identity: default_identity(),
            duration_secs: DEFAULT_LEASE_DURATION_SECS,
            grace_secs: DEFAULT_LEASE_GRACE_SECS,
        }
    }
}

impl LeaseSettings {
    /// Load settings from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: env::var("VMOPS_LEASE_NAME").unwrap_or(defaults.name),
            namespace: env::var("VMOPS_LEASE_NAMESPACE").unwrap_or(defaults.namespace),
            identity: defaults.identity,
            duration_secs: env::var("VMOPS_LEASE_DURATION_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.duration_secs),
            grace_secs: env::var("VMOPS_LEASE_GRACE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.grace_secs),
        }
    }
}

fn default_identity() -> String {
    env::var("POD_NAME")
        .or_else(|_| env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("vm-controller-{}", std::process::id()))
}

/// A running election; `changes` flips to `true` while this replica holds
/// the lease.
#[derive(Debug)]
pub struct LeaderElection {
    /// Leadership state channel
    pub changes: watch::Receiver<bool>,
}

/// Start contending for the lease. The background renewal task keeps
/// running for the life of the process.
pub async fn start(client: Client, settings: &LeaseSettings) -> Result<LeaderElection, ControllerError> {
    let manager = LeaseManagerBuilder::new(client, &settings.name)
        .with_namespace(&settings.namespace)
        .with_identity(&settings.identity)
        .with_duration(settings.duration_secs)
        .with_grace(settings.grace_secs)
        .build()
        .await
        .map_err(|e| ControllerError::Lease(e.to_string()))?;
    let (changes, _renewal_task) = manager.watch().await;
    Ok(LeaderElection { changes })
}

/// Block until this replica becomes leader.
pub async fn wait_for_leadership(changes: &mut watch::Receiver<bool>) -> Result<(), ControllerError> {
    while !*changes.borrow_and_update() {
        changes
            .changed()
            .await
            .map_err(|_| ControllerError::Lease("leadership channel closed".to_string()))?;
    }
    Ok(())
}

/// Resolve once leadership is lost (or the election task dies).
pub async fn monitor_leadership(mut changes: watch::Receiver<bool>) {
    loop {
        if changes.changed().await.is_err() {
            return;
        }
        if !*changes.borrow() {
            return;
        }
    }
}
