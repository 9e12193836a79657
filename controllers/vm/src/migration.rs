//! Live-migration coordination.
//!
//! Triggered when a running machine's desired node diverges from the node
//! its compute pod actually sits on. The transfer itself happens inside
//! the migration job; this module only keeps the job in existence, flags
//! the machine as Migrating, and reaps the job once it reaches a terminal
//! state so the next pass can reconcile the moved (or still misplaced)
//! pod.

use kube::ResourceExt;
use tracing::{debug, info};

use cluster_client::{ClientError, ClusterClient};
use crds::{VirtualMachine, VmState};

use crate::error::ControllerError;
use crate::reconcile_helpers::is_job_finished;
use crate::reconciler::Reconciler;
use crate::resources::build_migration_job;

impl<C: ClusterClient> Reconciler<C> {
    /// Drive a placement change: ensure the migration job exists and the
    /// machine reports Migrating, or clean the job up once it finished.
    pub(crate) async fn migrate_vm(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let vm_name = vm.name_any();
        let job_name = self.config().scheme.migration_job_name(&vm_name);

        match self.cluster().job_get(&job_name).await? {
            None => {
                let job = build_migration_job(vm, self.config());
                match self.cluster().job_create(&job).await {
                    Ok(_) => info!("vm {vm_name}: created migration job {job_name}"),
                    // Cache lag: the job exists but the snapshot missed it.
                    Err(e) if e.is_conflict() => debug!("migration job {job_name} already exists"),
                    Err(e) => return Err(e.into()),
                }
                self.mark_migrating(vm).await
            }
            Some(job) if is_job_finished(&job) => {
                // Success or failure, the job's view is complete; the next
                // Start pass reads the pod's actual placement and either
                // settles or re-triggers.
                info!("vm {vm_name}: migration job finished, removing it");
                match self.cluster().job_delete(&job_name).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Some(_) => {
                debug!("vm {vm_name}: migration in flight");
                self.mark_migrating(vm).await
            }
        }
    }

    /// Delete the migration job of a machine, reporting `NotFound` when
    /// none exists.
    pub(crate) async fn delete_migration_job(&self, vm_name: &str) -> Result<(), ClientError> {
        let job_name = self.config().scheme.migration_job_name(vm_name);
        self.cluster().job_delete(&job_name).await
    }

    async fn mark_migrating(&self, vm: &VirtualMachine) -> Result<(), ControllerError> {
        let state = vm.status.as_ref().map(|s| s.state).unwrap_or_default();
        if state == VmState::Migrating {
            return Ok(());
        }
        let mut updated = vm.clone();
        updated.status.get_or_insert_with(Default::default).state = VmState::Migrating;
        self.persist(vm, updated).await?;
        Ok(())
    }
}
