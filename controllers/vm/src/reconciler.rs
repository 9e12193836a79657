//! Reconciliation logic for VirtualMachine resources.
//!
//! One `reconcile` call is a full level-triggered pass for one VM key:
//! observed state is re-read from the caches, desired state recomputed from
//! the spec, and corrective writes issued. Passes are synchronous and
//! non-preemptible per key; a transient failure is retried by the work
//! queue, never in here.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, warn};

use cluster_client::{ClientError, ClusterClient};
use crds::naming::{labels_for, vm_name_selector, ROLE_VM};
use crds::{
    instance_id_for, mac_for, VirtualMachine, VmAction, VmState, FINALIZER_DELETION,
};

use crate::controller::ControllerConfig;
use crate::error::ControllerError;
use crate::reconcile_helpers::{
    alive_pods, is_pod_ready, is_pod_unschedulable, pod_node, required_affinity_node,
};
use crate::resources::{build_novnc_pod, build_novnc_service, build_vm_pod};

/// Reconciles VirtualMachine resources against the control plane.
pub struct Reconciler<C> {
    cluster: Arc<C>,
    config: ControllerConfig,
}

impl<C> std::fmt::Debug for Reconciler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: ClusterClient> Reconciler<C> {
    /// Create a reconciler issuing calls through the given client.
    pub fn new(cluster: Arc<C>, config: ControllerConfig) -> Self {
        Self { cluster, config }
    }

    pub(crate) fn cluster(&self) -> &C {
        &self.cluster
    }

    pub(crate) fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// One full pass for a VM key.
    ///
    /// An absent VM means the deletion already completed; the pass ends
    /// without error so the key is not requeued.
    pub async fn reconcile(&self, name: &str) -> Result<(), ControllerError> {
        let Some(vm) = self.cluster.vm_get(name).await? else {
            debug!("vm {name} no longer exists");
            return Ok(());
        };
        if vm.metadata.deletion_timestamp.is_some() {
            self.delete_vm(vm).await
        } else {
            self.update_vm(vm).await
        }
    }

    async fn update_vm(&self, vm: VirtualMachine) -> Result<(), ControllerError> {
        let vm = self.ensure_identity(vm).await?;
        match vm.spec.action {
            VmAction::Start => self.start_vm(&vm).await,
            VmAction::Stop => self.stop_vm(&vm).await,
            VmAction::Unknown => {
                // Stuck until the user fixes the spec; make that visible
                // instead of silently skipping the pass.
                warn!("vm {} carries an unrecognized action", vm.name_any());
                self.set_error_state(&vm).await
            }
        }
    }

    /// Assign instance id, MAC and the deletion finalizer once, persisting
    /// before the rest of the pass runs against the fresh object.
    async fn ensure_identity(&self, vm: VirtualMachine) -> Result<VirtualMachine, ControllerError> {
        let status = vm.status.clone().unwrap_or_default();
        let has_finalizer = !vm.finalizers().is_empty();
        if !status.id.is_empty() && !status.mac.is_empty() && has_finalizer {
            return Ok(vm);
        }

        let uid = vm.metadata.uid.clone().unwrap_or_default();
        let mut updated = vm.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        if status.id.is_empty() {
            status.id = instance_id_for(&uid);
        }
        if status.mac.is_empty() {
            status.mac = mac_for(&uid);
        }
        let finalizers = updated.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.is_empty() {
            finalizers.push(FINALIZER_DELETION.to_string());
        }
        info!(
            "vm {}: assigned id {} mac {}",
            vm.name_any(),
            updated.status.as_ref().map(|s| s.id.as_str()).unwrap_or(""),
            updated.status.as_ref().map(|s| s.mac.as_str()).unwrap_or(""),
        );
        self.persist(&vm, updated).await
    }

    /// Write the VM back only when spec, status or finalizers actually
    /// changed, and continue with whichever object is current.
    pub(crate) async fn persist(
        &self,
        current: &VirtualMachine,
        updated: VirtualMachine,
    ) -> Result<VirtualMachine, ControllerError> {
        if current.spec == updated.spec
            && current.status == updated.status
            && current.metadata.finalizers == updated.metadata.finalizers
        {
            return Ok(updated);
        }
        Ok(self.cluster.vm_update(&updated).await?)
    }

    /// Ensure-running: exactly one alive compute pod, status mirrored from
    /// it, display proxy up when requested, placement corrections applied.
    async fn start_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let vm_name = vm.name_any();
        let pods = self
            .cluster
            .pods_list(&labels_for(&vm_name, ROLE_VM))
            .await?;
        let alive: Vec<_> = alive_pods(&pods).into_iter().cloned().collect();

        let pod = match alive.len() {
            0 => {
                let public_keys = self.resolve_public_keys(vm).await?;
                let pod = build_vm_pod(vm, &public_keys, &self.config, false);
                let created = self.cluster.pod_create(&pod).await?;
                info!("vm {vm_name}: created compute pod {}", created.name_any());
                created
            }
            1 => alive.into_iter().next().unwrap_or_default(),
            n => {
                // Two live compute pods means a duplicated machine; no safe
                // automatic pick exists.
                warn!("vm {vm_name} has {n} live compute pods, refusing to adopt one");
                return self.set_error_state(vm).await;
            }
        };

        let vm = self.mirror_pod_status(vm, &pod).await?;
        let state = vm.status.as_ref().map(|s| s.state).unwrap_or_default();

        if vm.spec.hosted_novnc {
            // Best effort: a broken display proxy must not wedge the
            // machine itself.
            if let Err(e) = self.ensure_novnc(&vm).await {
                warn!("vm {vm_name}: display proxy setup failed: {e}");
            }
        }

        // A machine stuck Pending may be waiting on a node that is no
        // longer the desired one; recreate the pod with fresh affinity.
        if state == VmState::Pending && is_pod_unschedulable(&pod) {
            if let Some(pinned) = required_affinity_node(&pod) {
                if vm.spec.node_name.as_deref() != Some(pinned) {
                    info!("vm {vm_name}: desired node changed while unschedulable, deleting pod");
                    let pod_name = pod.name_any();
                    return match self.cluster.pod_delete(&pod_name).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_not_found() => Ok(()),
                        Err(e) => Err(e.into()),
                    };
                }
            }
        }

        if let Some(desired) = vm.spec.node_name.as_deref() {
            let misplaced = !desired.is_empty() && pod_node(&pod) != Some(desired);
            if misplaced && matches!(state, VmState::Running | VmState::Migrating) {
                return self.migrate_vm(&vm).await;
            }
        }

        Ok(())
    }

    /// Mirror node placement and lifecycle state from the compute pod into
    /// the VM status.
    async fn mirror_pod_status(
        &self,
        vm: &VirtualMachine,
        pod: &k8s_openapi::api::core::v1::Pod,
    ) -> Result<VirtualMachine, ControllerError> {
        let mut updated = vm.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        if let Some(node) = pod_node(pod) {
            if !node.is_empty() {
                status.node_name = node.to_string();
            }
        }
        if let Some(host_ip) = pod.status.as_ref().and_then(|s| s.host_ip.as_deref()) {
            if !host_ip.is_empty() {
                status.node_ip = host_ip.to_string();
            }
        }
        status.state = if pod.metadata.deletion_timestamp.is_some() {
            VmState::Stopping
        } else if is_pod_ready(pod) {
            VmState::Running
        } else {
            VmState::Pending
        };
        self.persist(vm, updated).await
    }

    /// Create the display-proxy pod and service when absent.
    async fn ensure_novnc(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let vm_name = vm.name_any();
        let pod_name = self.config.scheme.novnc_pod_name(&vm_name);
        if self.cluster.pod_get(&pod_name).await?.is_none() {
            let pod = build_novnc_pod(&vm_name, &self.config);
            match self.cluster.pod_create(&pod).await {
                Ok(_) => info!("vm {vm_name}: created display proxy pod"),
                Err(e) if e.is_conflict() => {} // cache lag, already there
                Err(e) => return Err(e.into()),
            }
        }
        let service_name = self.config.scheme.novnc_service_name(&vm_name);
        if self.cluster.service_get(&service_name).await?.is_none() {
            let service = build_novnc_service(&vm_name, &self.config);
            match self.cluster.service_create(&service).await {
                Ok(_) => info!("vm {vm_name}: created display proxy service"),
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Public key material for the credentials the VM references; missing
    /// credentials are skipped with a warning.
    async fn resolve_public_keys(
        &self,
        vm: &VirtualMachine,
    ) -> Result<Vec<String>, ControllerError> {
        let mut keys = Vec::with_capacity(vm.spec.public_keys.len());
        for name in &vm.spec.public_keys {
            match self.cluster.credential_get(name).await? {
                Some(credential) => keys.push(credential.spec.public_key),
                None => warn!("vm {}: credential {name:?} not found", vm.name_any()),
            }
        }
        Ok(keys)
    }

    /// Ensure-stopped: delete the compute pods, the migration job and the
    /// display-proxy pair, each independently.
    ///
    /// The persisted state is whichever outcome was evaluated last; the
    /// order below is fixed but carries no declared priority.
    async fn stop_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let vm_name = vm.name_any();
        let mut updated = vm.clone();
        let status = updated.status.get_or_insert_with(Default::default);

        match self.delete_vm_pods(&vm_name).await {
            Ok(()) => status.state = VmState::Stopping,
            Err(e) if e.is_not_found() => {
                status.state = VmState::Stopped;
                status.node_name.clear();
            }
            Err(e) => {
                warn!("vm {vm_name}: compute pod deletion failed: {e}");
                status.state = VmState::Error;
            }
        }

        match self.delete_migration_job(&vm_name).await {
            Ok(()) => status.state = VmState::Stopping,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("vm {vm_name}: migration job deletion failed: {e}");
                status.state = VmState::Error;
            }
        }

        let novnc_pod = self.config.scheme.novnc_pod_name(&vm_name);
        match self.cluster.pod_delete(&novnc_pod).await {
            Ok(()) => status.state = VmState::Stopping,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("vm {vm_name}: display proxy pod deletion failed: {e}");
                status.state = VmState::Error;
            }
        }

        let novnc_service = self.config.scheme.novnc_service_name(&vm_name);
        match self.cluster.service_delete(&novnc_service).await {
            Ok(()) => status.state = VmState::Stopping,
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("vm {vm_name}: display proxy service deletion failed: {e}");
                status.state = VmState::Error;
            }
        }

        self.persist(vm, updated).await?;
        Ok(())
    }

    /// Delete every pod labeled with the VM's name. Reports `NotFound`
    /// when the cache shows none, so callers can treat "already gone" as
    /// the goal being met.
    pub(crate) async fn delete_vm_pods(&self, vm_name: &str) -> Result<(), ClientError> {
        let selector = vm_name_selector(vm_name);
        let pods = self.cluster.pods_list(&selector).await?;
        if pods.is_empty() {
            return Err(ClientError::NotFound {
                kind: "Pod",
                name: vm_name.to_string(),
            });
        }
        debug!("deleting {} pod(s) of vm {vm_name}", pods.len());
        self.cluster.pods_delete_collection(&selector).await
    }

    /// Deletion protocol: mark Terminating, delete dependents, and only
    /// once all report gone clear the finalizers and remove the VM itself.
    async fn delete_vm(&self, vm: VirtualMachine) -> Result<(), ControllerError> {
        let state = vm.status.as_ref().map(|s| s.state).unwrap_or_default();
        let vm = if state == VmState::Terminating {
            vm
        } else {
            let mut updated = vm.clone();
            updated.status.get_or_insert_with(Default::default).state = VmState::Terminating;
            self.persist(&vm, updated).await?
        };

        let vm_name = vm.name_any();
        let pods = self.delete_vm_pods(&vm_name).await;
        let novnc_pod = self
            .cluster
            .pod_delete(&self.config.scheme.novnc_pod_name(&vm_name))
            .await;
        let novnc_service = self
            .cluster
            .service_delete(&self.config.scheme.novnc_service_name(&vm_name))
            .await;

        let all_gone = [&pods, &novnc_pod, &novnc_service]
            .iter()
            .all(|r| matches!(r, Err(e) if e.is_not_found()));
        if !all_gone {
            // Dependent deletions generate their own watch events, which
            // bring this key back once they complete.
            debug!("vm {vm_name}: dependents still terminating");
            return Ok(());
        }

        let mut updated = vm.clone();
        updated.metadata.finalizers = Some(Vec::new());
        match self.persist(&vm, updated).await {
            Ok(_) => match self.cluster.vm_delete(&vm_name).await {
                Ok(()) => {
                    info!("vm {vm_name}: removed");
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.into()),
            },
            Err(e) => {
                // A lost write race here is fine: the next pass retries.
                warn!("vm {vm_name}: failed to clear finalizers: {e}");
                Ok(())
            }
        }
    }

    /// Record an Error state pending external correction; intentionally
    /// does not fail the pass, so the key is not requeued.
    async fn set_error_state(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let mut updated = vm.clone();
        updated.status.get_or_insert_with(Default::default).state = VmState::Error;
        self.persist(vm, updated).await?;
        Ok(())
    }
}
