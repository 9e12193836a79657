//! Controller wiring and worker loops.
//!
//! `run` owns the lifecycle while this replica holds leadership: start the
//! watch streams, block until every cache synced, then run one worker per
//! queue. Pod and job workers never reconcile anything themselves — they
//! derive the owning VM name and funnel it onto the VM queue, so every
//! reconciliation decision happens in exactly one place and the queue's
//! no-concurrent-delivery guarantee covers all three trigger paths.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cluster_client::{ClusterClient, KubeClusterClient};
use crds::naming::NameScheme;

use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::watcher;

/// Controller settings, loaded from the environment with defaults.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace dependent resources live in
    pub namespace: String,
    /// Host bridge interface the machines attach to
    pub bridge_iface: String,
    /// Suppress cpu/memory requests and limits on compute pods
    pub no_resource_limits: bool,
    /// Image for the display-proxy pod
    pub novnc_image: String,
    /// Image for the migration job
    pub migration_image: String,
    /// Dependent naming scheme
    pub scheme: NameScheme,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "vmops".to_string(),
            bridge_iface: "br0".to_string(),
            no_resource_limits: false,
            novnc_image: "vmops/novnc:0.3".to_string(),
            migration_image: "vmops/migrate:0.3".to_string(),
            scheme: NameScheme::default(),
        }
    }
}

impl ControllerConfig {
    /// Load settings from environment variables, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            namespace: env::var("VMOPS_NAMESPACE").unwrap_or(defaults.namespace),
            bridge_iface: env::var("VMOPS_BRIDGE_IFACE").unwrap_or(defaults.bridge_iface),
            no_resource_limits: env::var("VMOPS_NO_RESOURCE_LIMITS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.no_resource_limits),
            novnc_image: env::var("VMOPS_NOVNC_IMAGE").unwrap_or(defaults.novnc_image),
            migration_image: env::var("VMOPS_MIGRATE_IMAGE").unwrap_or(defaults.migration_image),
            scheme: defaults.scheme,
        }
    }
}

/// The three work queues, one per watched type that triggers work.
#[derive(Debug)]
pub struct Queues {
    /// VM names awaiting reconciliation
    pub vms: Arc<WorkQueue>,
    /// Pod names awaiting owner derivation
    pub pods: Arc<WorkQueue>,
    /// Job names awaiting owner derivation
    pub jobs: Arc<WorkQueue>,
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

impl Queues {
    /// Three empty queues with default rate limiting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vms: Arc::new(WorkQueue::new("virtualmachine")),
            pods: Arc::new(WorkQueue::new("pod")),
            jobs: Arc::new(WorkQueue::new("job")),
        }
    }

    /// Stop all queues and wake their workers.
    pub fn shut_down(&self) {
        self.vms.shut_down();
        self.pods.shut_down();
        self.jobs.shut_down();
    }
}

/// Run the controller until the token cancels: watches, cache-sync
/// barrier, worker loops, cooperative drain.
pub async fn run(
    client: Client,
    config: ControllerConfig,
    cancel: CancellationToken,
    ready: Arc<AtomicBool>,
) -> Result<(), ControllerError> {
    let queues = Arc::new(Queues::new());
    let (caches, watch_tasks) = watcher::spawn_watches(&client, &config.namespace, &queues, &cancel);

    info!("waiting for caches to sync");
    tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        result = watcher::wait_for_cache_sync(&caches) => result?,
    }
    info!("caches synced, starting workers");
    ready.store(true, Ordering::SeqCst);

    let cluster = Arc::new(KubeClusterClient::new(client, &config.namespace, caches));
    let scheme = config.scheme;
    let reconciler = Arc::new(Reconciler::new(cluster, config));

    let vm_worker = {
        let queues = Arc::clone(&queues);
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { run_vm_worker(&queues, &reconciler).await })
    };
    let pod_worker = {
        let queues = Arc::clone(&queues);
        tokio::spawn(async move { run_pod_worker(&queues, scheme).await })
    };
    let job_worker = {
        let queues = Arc::clone(&queues);
        tokio::spawn(async move { run_job_worker(&queues, scheme).await })
    };

    cancel.cancelled().await;
    info!("stopping controller");
    ready.store(false, Ordering::SeqCst);
    queues.shut_down();
    // In-flight passes finish; nothing is cancelled mid-write.
    for task in [vm_worker, pod_worker, job_worker] {
        let _ = task.await;
    }
    for task in watch_tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Consume VM keys: reconcile to completion, clear backoff on success,
/// redeliver with backoff on transient failure.
pub(crate) async fn run_vm_worker<C: ClusterClient>(queues: &Queues, reconciler: &Reconciler<C>) {
    while let Some(key) = queues.vms.get().await {
        match reconciler.reconcile(&key).await {
            Ok(()) => queues.vms.forget(&key),
            Err(e) => {
                warn!("vm {key}: reconciliation failed, requeueing: {e}");
                queues.vms.add_rate_limited(key.clone());
            }
        }
        queues.vms.done(&key);
    }
    debug!("vm worker stopped");
}

/// Consume pod keys: derive the owning VM and wake it.
pub(crate) async fn run_pod_worker(queues: &Queues, scheme: NameScheme) {
    while let Some(key) = queues.pods.get().await {
        match scheme.owner_vm_name(&key) {
            Some(owner) => {
                debug!("pod {key}: waking vm {owner}");
                queues.vms.add(owner);
            }
            None => debug!("pod {key} carries no owner suffix, ignoring"),
        }
        queues.pods.done(&key);
    }
    debug!("pod worker stopped");
}

/// Consume job keys: derive the owning VM and wake it.
pub(crate) async fn run_job_worker(queues: &Queues, scheme: NameScheme) {
    while let Some(key) = queues.jobs.get().await {
        match scheme.owner_vm_name(&key) {
            Some(owner) => {
                debug!("job {key}: waking vm {owner}");
                queues.vms.add(owner);
            }
            None => debug!("job {key} carries no owner suffix, ignoring"),
        }
        queues.jobs.done(&key);
    }
    debug!("job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_vm;
    use crate::watcher::dispatch_pod_event;
    use cluster_client::MockClusterClient;
    use crds::naming::ROLE_VM;
    use crds::VmAction;
    use kube_runtime::watcher::Event;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pod_and_job_keys_funnel_into_vm_queue() {
        let queues = Arc::new(Queues::new());
        let scheme = NameScheme::default();

        queues.pods.add("v1-a1b2c");
        queues.jobs.add("v2-migrate");
        queues.pods.shut_down();
        queues.jobs.shut_down();

        run_pod_worker(&queues, scheme).await;
        run_job_worker(&queues, scheme).await;

        assert_eq!(queues.vms.get().await.as_deref(), Some("v1"));
        assert_eq!(queues.vms.get().await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_tombstoned_delete_resolves_to_owning_vm() {
        let queues = Arc::new(Queues::new());
        let scheme = NameScheme::default();

        // A delete notification wraps the pod's last-known (stale) state.
        let mut pod = crate::test_utils::make_pod("v1-a1b2c", "v1", ROLE_VM);
        pod.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ));
        dispatch_pod_event(&Event::Delete(pod), &queues);

        queues.pods.shut_down();
        run_pod_worker(&queues, scheme).await;

        assert_eq!(queues.vms.get().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_failed_pass_is_redelivered_with_backoff() {
        let queues = Arc::new(Queues::new());
        let mock = Arc::new(MockClusterClient::new());
        mock.add_vm(make_vm("v1", VmAction::Start));
        mock.fail_next("pod_create", "apiserver unavailable");
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&mock),
            ControllerConfig::default(),
        ));

        let worker = {
            let queues = Arc::clone(&queues);
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { run_vm_worker(&queues, &reconciler).await })
        };

        queues.vms.add("v1");

        // First pass fails and re-enqueues; the retry succeeds and creates
        // the compute pod.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while mock.all_pods().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "pod never created");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        queues.vms.shut_down();
        worker.await.unwrap();
        assert_eq!(queues.vms.failures("v1"), 0, "success clears backoff");
    }
}
