//! Kubernetes-backed implementation of the [`ClusterClient`] trait.
//!
//! Reads never hit the API server: they are served from reflector stores
//! kept current by the controller's watch layer. Writes use the typed
//! `kube::Api` surface; `replace` carries the caller's resourceVersion, so
//! a lost get-modify-write race surfaces as a 409 for the requeue path.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use kube_runtime::reflector::{ObjectRef, Store};

use crate::cluster_trait::ClusterClient;
use crate::error::{classify, ClientError};
use crate::selector_matches;
use crds::{Credential, VirtualMachine};

/// Reflector stores for the five watched collections.
///
/// Built by the controller's watch layer; each store answers point-in-time
/// snapshot reads once its initial list has completed.
#[derive(Clone)]
pub struct WatchCaches {
    /// VirtualMachine cache (cluster-scoped)
    pub vms: Store<VirtualMachine>,
    /// Pod cache for the dependents namespace
    pub pods: Store<Pod>,
    /// Job cache for the dependents namespace
    pub jobs: Store<Job>,
    /// Service cache for the dependents namespace
    pub services: Store<Service>,
    /// Credential cache (cluster-scoped)
    pub credentials: Store<Credential>,
}

impl std::fmt::Debug for WatchCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchCaches").finish_non_exhaustive()
    }
}

/// Control-plane client combining cached reads with direct API writes.
#[derive(Clone)]
pub struct KubeClusterClient {
    namespace: String,
    vm_api: Api<VirtualMachine>,
    pod_api: Api<Pod>,
    job_api: Api<Job>,
    service_api: Api<Service>,
    caches: WatchCaches,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Create a client writing dependents into `namespace` and reading
    /// from the given watch caches.
    #[must_use]
    pub fn new(client: Client, namespace: &str, caches: WatchCaches) -> Self {
        Self {
            namespace: namespace.to_string(),
            vm_api: Api::all(client.clone()),
            pod_api: Api::namespaced(client.clone(), namespace),
            job_api: Api::namespaced(client.clone(), namespace),
            service_api: Api::namespaced(client, namespace),
            caches,
        }
    }

    fn object_name(
        meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
        kind: &str,
    ) -> Result<String, ClientError> {
        meta.name
            .clone()
            .ok_or_else(|| ClientError::InvalidObject(format!("{kind} without a name")))
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn vm_get(&self, name: &str) -> Result<Option<VirtualMachine>, ClientError> {
        let obj = self.caches.vms.get(&ObjectRef::new(name));
        Ok(obj.map(|vm| (*vm).clone()))
    }

    async fn pod_get(&self, name: &str) -> Result<Option<Pod>, ClientError> {
        let key = ObjectRef::new(name).within(&self.namespace);
        Ok(self.caches.pods.get(&key).map(|pod| (*pod).clone()))
    }

    async fn pods_list(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClientError> {
        Ok(self
            .caches
            .pods
            .state()
            .iter()
            .filter(|pod| selector_matches(pod.metadata.labels.as_ref(), selector))
            .map(|pod| (**pod).clone())
            .collect())
    }

    async fn job_get(&self, name: &str) -> Result<Option<Job>, ClientError> {
        let key = ObjectRef::new(name).within(&self.namespace);
        Ok(self.caches.jobs.get(&key).map(|job| (*job).clone()))
    }

    async fn service_get(&self, name: &str) -> Result<Option<Service>, ClientError> {
        let key = ObjectRef::new(name).within(&self.namespace);
        Ok(self.caches.services.get(&key).map(|svc| (*svc).clone()))
    }

    async fn credential_get(&self, name: &str) -> Result<Option<Credential>, ClientError> {
        let obj = self.caches.credentials.get(&ObjectRef::new(name));
        Ok(obj.map(|cred| (*cred).clone()))
    }

    async fn vm_update(&self, vm: &VirtualMachine) -> Result<VirtualMachine, ClientError> {
        let name = Self::object_name(&vm.metadata, "VirtualMachine")?;
        self.vm_api
            .replace(&name, &PostParams::default(), vm)
            .await
            .map_err(|e| classify("VirtualMachine", &name, e))
    }

    async fn vm_delete(&self, name: &str) -> Result<(), ClientError> {
        self.vm_api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify("VirtualMachine", name, e))
    }

    async fn pod_create(&self, pod: &Pod) -> Result<Pod, ClientError> {
        let name = pod
            .metadata
            .name
            .clone()
            .or_else(|| pod.metadata.generate_name.clone())
            .unwrap_or_default();
        self.pod_api
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| classify("Pod", &name, e))
    }

    async fn pod_delete(&self, name: &str) -> Result<(), ClientError> {
        self.pod_api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify("Pod", name, e))
    }

    async fn pods_delete_collection(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        let labels = selector_string(selector);
        self.pod_api
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&labels),
            )
            .await
            .map(|_| ())
            .map_err(|e| classify("Pod", &labels, e))
    }

    async fn job_create(&self, job: &Job) -> Result<Job, ClientError> {
        let name = Self::object_name(&job.metadata, "Job")?;
        self.job_api
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| classify("Job", &name, e))
    }

    async fn job_delete(&self, name: &str) -> Result<(), ClientError> {
        self.job_api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify("Job", name, e))
    }

    async fn service_create(&self, service: &Service) -> Result<Service, ClientError> {
        let name = Self::object_name(&service.metadata, "Service")?;
        self.service_api
            .create(&PostParams::default(), service)
            .await
            .map_err(|e| classify("Service", &name, e))
    }

    async fn service_delete(&self, name: &str) -> Result<(), ClientError> {
        self.service_api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify("Service", name, e))
    }
}
