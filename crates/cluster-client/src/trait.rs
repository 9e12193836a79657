//! ClusterClient trait for mocking
//!
//! Abstracts the control plane so reconcilers can be unit tested against an
//! in-memory implementation. Reads are served from the watch caches and are
//! eventually consistent; writes go to the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};

use crate::error::ClientError;
use crds::{Credential, VirtualMachine};

/// Control-plane operations used by the reconciliation loop.
///
/// All async methods must be `Send` to work with Tokio's work-stealing
/// runtime. Cache reads return `Ok(None)` for absent objects; deletes
/// return [`ClientError::NotFound`] so callers can treat "already gone" as
/// goal satisfied.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    // Cache reads
    async fn vm_get(&self, name: &str) -> Result<Option<VirtualMachine>, ClientError>;
    async fn pod_get(&self, name: &str) -> Result<Option<Pod>, ClientError>;
    async fn pods_list(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClientError>;
    async fn job_get(&self, name: &str) -> Result<Option<Job>, ClientError>;
    async fn service_get(&self, name: &str) -> Result<Option<Service>, ClientError>;
    async fn credential_get(&self, name: &str) -> Result<Option<Credential>, ClientError>;

    // Control-plane writes
    async fn vm_update(&self, vm: &VirtualMachine) -> Result<VirtualMachine, ClientError>;
    async fn vm_delete(&self, name: &str) -> Result<(), ClientError>;
    async fn pod_create(&self, pod: &Pod) -> Result<Pod, ClientError>;
    async fn pod_delete(&self, name: &str) -> Result<(), ClientError>;
    async fn pods_delete_collection(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<(), ClientError>;
    async fn job_create(&self, job: &Job) -> Result<Job, ClientError>;
    async fn job_delete(&self, name: &str) -> Result<(), ClientError>;
    async fn service_create(&self, service: &Service) -> Result<Service, ClientError>;
    async fn service_delete(&self, name: &str) -> Result<(), ClientError>;
}
