//! Mock ClusterClient for unit testing
//!
//! In-memory implementation of [`ClusterClient`] that needs no cluster.
//! Beyond serving reads, it records every write operation (so tests can
//! assert a converged reconciliation issues none) and supports injecting a
//! failure for a named operation to exercise the requeue path.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};

use crate::cluster_trait::ClusterClient;
use crate::error::ClientError;
use crate::selector_matches;
use crds::{Credential, VirtualMachine};

/// Mock ClusterClient for testing.
///
/// Objects are keyed by name. `pod_create` honors `generateName` with a
/// deterministic counter suffix, mirroring the API server contract without
/// process randomness.
#[derive(Clone, Default)]
pub struct MockClusterClient {
    vms: Arc<Mutex<HashMap<String, VirtualMachine>>>,
    pods: Arc<Mutex<HashMap<String, Pod>>>,
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    services: Arc<Mutex<HashMap<String, Service>>>,
    credentials: Arc<Mutex<HashMap<String, Credential>>>,
    // Write-operation journal, e.g. "pod_create v1-00001"
    ops: Arc<Mutex<Vec<String>>>,
    // Operation name -> error message; consumed on first hit
    failures: Arc<Mutex<HashMap<String, String>>>,
    next_suffix: Arc<Mutex<u32>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a VirtualMachine (for test setup).
    pub fn add_vm(&self, vm: VirtualMachine) {
        let name = vm.metadata.name.clone().unwrap_or_default();
        self.vms.lock().unwrap().insert(name, vm);
    }

    /// Seed a Pod (for test setup).
    pub fn add_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.lock().unwrap().insert(name, pod);
    }

    /// Seed a Job (for test setup).
    pub fn add_job(&self, job: Job) {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.jobs.lock().unwrap().insert(name, job);
    }

    /// Seed a Service (for test setup).
    pub fn add_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services.lock().unwrap().insert(name, service);
    }

    /// Seed a Credential (for test setup).
    pub fn add_credential(&self, credential: Credential) {
        let name = credential.metadata.name.clone().unwrap_or_default();
        self.credentials.lock().unwrap().insert(name, credential);
    }

    /// Make the next call to `operation` fail with a generic API error.
    pub fn fail_next(&self, operation: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(operation.to_string(), message.to_string());
    }

    /// Drain and return the write-operation journal.
    pub fn take_ops(&self) -> Vec<String> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }

    /// Current VM object, if any.
    #[must_use]
    pub fn vm(&self, name: &str) -> Option<VirtualMachine> {
        self.vms.lock().unwrap().get(name).cloned()
    }

    /// Current pods, in name order.
    #[must_use]
    pub fn all_pods(&self) -> Vec<Pod> {
        let guard = self.pods.lock().unwrap();
        let mut names: Vec<&String> = guard.keys().collect();
        names.sort();
        names.iter().map(|n| guard[*n].clone()).collect()
    }

    /// Current job object, if any.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(name).cloned()
    }

    /// Current service object, if any.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<Service> {
        self.services.lock().unwrap().get(name).cloned()
    }

    fn record(&self, entry: String) {
        self.ops.lock().unwrap().push(entry);
    }

    fn check_failure(&self, operation: &str) -> Result<(), ClientError> {
        if let Some(message) = self.failures.lock().unwrap().remove(operation) {
            return Err(ClientError::Api(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message,
                    reason: "InternalError".to_string(),
                    code: 500,
                },
            )));
        }
        Ok(())
    }

    fn not_found(kind: &'static str, name: &str) -> ClientError {
        ClientError::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn vm_get(&self, name: &str) -> Result<Option<VirtualMachine>, ClientError> {
        Ok(self.vms.lock().unwrap().get(name).cloned())
    }

    async fn pod_get(&self, name: &str) -> Result<Option<Pod>, ClientError> {
        Ok(self.pods.lock().unwrap().get(name).cloned())
    }

    async fn pods_list(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClientError> {
        let guard = self.pods.lock().unwrap();
        let mut names: Vec<&String> = guard
            .iter()
            .filter(|(_, pod)| selector_matches(pod.metadata.labels.as_ref(), selector))
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names.iter().map(|n| guard[*n].clone()).collect())
    }

    async fn job_get(&self, name: &str) -> Result<Option<Job>, ClientError> {
        Ok(self.jobs.lock().unwrap().get(name).cloned())
    }

    async fn service_get(&self, name: &str) -> Result<Option<Service>, ClientError> {
        Ok(self.services.lock().unwrap().get(name).cloned())
    }

    async fn credential_get(&self, name: &str) -> Result<Option<Credential>, ClientError> {
        Ok(self.credentials.lock().unwrap().get(name).cloned())
    }

    async fn vm_update(&self, vm: &VirtualMachine) -> Result<VirtualMachine, ClientError> {
        self.check_failure("vm_update")?;
        let name = vm
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClientError::InvalidObject("VirtualMachine without a name".into()))?;
        self.record(format!("vm_update {name}"));
        self.vms.lock().unwrap().insert(name, vm.clone());
        Ok(vm.clone())
    }

    async fn vm_delete(&self, name: &str) -> Result<(), ClientError> {
        self.check_failure("vm_delete")?;
        self.record(format!("vm_delete {name}"));
        self.vms
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("VirtualMachine", name))
    }

    async fn pod_create(&self, pod: &Pod) -> Result<Pod, ClientError> {
        self.check_failure("pod_create")?;
        let mut pod = pod.clone();
        let name = match pod.metadata.name.clone() {
            Some(name) => name,
            None => {
                let prefix = pod.metadata.generate_name.clone().ok_or_else(|| {
                    ClientError::InvalidObject("Pod without name or generateName".into())
                })?;
                let mut counter = self.next_suffix.lock().unwrap();
                *counter += 1;
                let name = format!("{prefix}{:05}", *counter);
                pod.metadata.name = Some(name.clone());
                name
            }
        };
        self.record(format!("pod_create {name}"));
        let mut guard = self.pods.lock().unwrap();
        if guard.contains_key(&name) {
            return Err(ClientError::Conflict(format!("Pod {name:?} exists")));
        }
        guard.insert(name, pod.clone());
        Ok(pod)
    }

    async fn pod_delete(&self, name: &str) -> Result<(), ClientError> {
        self.check_failure("pod_delete")?;
        self.record(format!("pod_delete {name}"));
        self.pods
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("Pod", name))
    }

    async fn pods_delete_collection(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        self.check_failure("pods_delete_collection")?;
        let labels: Vec<String> = selector.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.record(format!("pods_delete_collection {}", labels.join(",")));
        self.pods
            .lock()
            .unwrap()
            .retain(|_, pod| !selector_matches(pod.metadata.labels.as_ref(), selector));
        Ok(())
    }

    async fn job_create(&self, job: &Job) -> Result<Job, ClientError> {
        self.check_failure("job_create")?;
        let name = job
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClientError::InvalidObject("Job without a name".into()))?;
        self.record(format!("job_create {name}"));
        let mut guard = self.jobs.lock().unwrap();
        if guard.contains_key(&name) {
            return Err(ClientError::Conflict(format!("Job {name:?} exists")));
        }
        guard.insert(name, job.clone());
        Ok(job.clone())
    }

    async fn job_delete(&self, name: &str) -> Result<(), ClientError> {
        self.check_failure("job_delete")?;
        self.record(format!("job_delete {name}"));
        self.jobs
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("Job", name))
    }

    async fn service_create(&self, service: &Service) -> Result<Service, ClientError> {
        self.check_failure("service_create")?;
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClientError::InvalidObject("Service without a name".into()))?;
        self.record(format!("service_create {name}"));
        let mut guard = self.services.lock().unwrap();
        if guard.contains_key(&name) {
            return Err(ClientError::Conflict(format!("Service {name:?} exists")));
        }
        guard.insert(name, service.clone());
        Ok(service.clone())
    }

    async fn service_delete(&self, name: &str) -> Result<(), ClientError> {
        self.check_failure("service_delete")?;
        self.record(format!("service_delete {name}"));
        self.services
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("Service", name))
    }
}
