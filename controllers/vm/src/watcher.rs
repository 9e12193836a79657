//! Watch layer and event dispatch.
//!
//! One typed watcher+reflector stream per watched collection keeps the
//! caches current; the dispatch functions turn change notifications into
//! work-queue keys. Delete notifications carry the last-known object, so a
//! stale ("tombstoned") payload still yields the right key. All
//! reconciliation decisions stay in the workers — dispatch only filters
//! and enqueues.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::Api;
use kube::{Client, Resource};
use kube_runtime::reflector::{self, Store};
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cluster_client::client::WatchCaches;
use crds::naming::{LABEL_APP, LABEL_APP_VALUE, LABEL_ROLE, ROLE_MIGRATE};
use crds::{Credential, VirtualMachine};

use crate::controller::Queues;
use crate::error::ControllerError;

/// Start the five watch streams; returns the caches they feed plus the
/// pump tasks (which stop on cancellation).
pub fn spawn_watches(
    client: &Client,
    namespace: &str,
    queues: &Arc<Queues>,
    cancel: &CancellationToken,
) -> (WatchCaches, Vec<JoinHandle<()>>) {
    let vm_api: Api<VirtualMachine> = Api::all(client.clone());
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let job_api: Api<Job> = Api::namespaced(client.clone(), namespace);
    let service_api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let credential_api: Api<Credential> = Api::all(client.clone());

    let q = Arc::clone(queues);
    let (vms, vm_task) = spawn_reflector(vm_api, "VirtualMachine", cancel.clone(), move |event| {
        dispatch_vm_event(event, &q);
    });
    let q = Arc::clone(queues);
    let (pods, pod_task) = spawn_reflector(pod_api, "Pod", cancel.clone(), move |event| {
        dispatch_pod_event(event, &q);
    });
    let q = Arc::clone(queues);
    let (jobs, job_task) = spawn_reflector(job_api, "Job", cancel.clone(), move |event| {
        dispatch_job_event(event, &q);
    });
    // Services and credentials are watched for cache completeness only;
    // nothing is enqueued for them.
    let (services, service_task) = spawn_reflector(service_api, "Service", cancel.clone(), |_| {});
    let (credentials, credential_task) =
        spawn_reflector(credential_api, "Credential", cancel.clone(), |_| {});

    let caches = WatchCaches {
        vms,
        pods,
        jobs,
        services,
        credentials,
    };
    let tasks = vec![vm_task, pod_task, job_task, service_task, credential_task];
    (caches, tasks)
}

/// Block until every watched collection finished its initial list.
pub async fn wait_for_cache_sync(caches: &WatchCaches) -> Result<(), ControllerError> {
    let sync = |kind: &'static str| move |e| ControllerError::Watch(format!("{kind} cache: {e}"));
    caches.vms.wait_until_ready().await.map_err(sync("VirtualMachine"))?;
    caches.pods.wait_until_ready().await.map_err(sync("Pod"))?;
    caches.jobs.wait_until_ready().await.map_err(sync("Job"))?;
    caches.services.wait_until_ready().await.map_err(sync("Service"))?;
    caches
        .credentials
        .wait_until_ready()
        .await
        .map_err(sync("Credential"))?;
    Ok(())
}

/// Run a watcher-fed reflector for one collection, handing every event to
/// `on_event`. Watch errors are transient (the watcher re-lists and
/// resumes internally) and only logged.
fn spawn_reflector<K, F>(
    api: Api<K>,
    kind: &'static str,
    cancel: CancellationToken,
    on_event: F,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    F: Fn(&watcher::Event<K>) + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(
        writer,
        watcher::watcher(api, watcher::Config::default().any_semantic()),
    );
    let handle = tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(event)) => on_event(&event),
                    Some(Err(e)) => warn!("{kind} watch error: {e}"),
                    None => break,
                },
            }
        }
        debug!("{kind} watch stopped");
    });
    (reader, handle)
}

pub(crate) fn dispatch_vm_event(event: &watcher::Event<VirtualMachine>, queues: &Queues) {
    match event {
        watcher::Event::Apply(vm)
        | watcher::Event::InitApply(vm)
        | watcher::Event::Delete(vm) => {
            if let Some(name) = vm.metadata.name.as_deref() {
                queues.vms.add(name);
            }
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

pub(crate) fn dispatch_pod_event(event: &watcher::Event<Pod>, queues: &Queues) {
    match event {
        watcher::Event::Apply(pod)
        | watcher::Event::InitApply(pod)
        | watcher::Event::Delete(pod) => {
            if !pod_event_filter(pod) {
                return;
            }
            if let Some(name) = pod.metadata.name.as_deref() {
                queues.pods.add(name);
            }
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

pub(crate) fn dispatch_job_event(event: &watcher::Event<Job>, queues: &Queues) {
    match event {
        watcher::Event::Apply(job)
        | watcher::Event::InitApply(job)
        | watcher::Event::Delete(job) => {
            if !job_event_filter(job) {
                return;
            }
            if let Some(name) = job.metadata.name.as_deref() {
                queues.jobs.add(name);
            }
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

/// Pods of ours except migration workers; migration progress is observed
/// through job events instead.
pub(crate) fn pod_event_filter(pod: &Pod) -> bool {
    let Some(labels) = pod.metadata.labels.as_ref() else {
        return false;
    };
    labels.get(LABEL_APP).map(String::as_str) == Some(LABEL_APP_VALUE)
        && labels
            .get(LABEL_ROLE)
            .is_some_and(|role| role != ROLE_MIGRATE)
}

/// Any job carrying our application tag.
pub(crate) fn job_event_filter(job: &Job) -> bool {
    job.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.get(LABEL_APP).map(String::as_str) == Some(LABEL_APP_VALUE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_job, make_pod};
    use crds::naming::{ROLE_NOVNC, ROLE_VM};

    #[tokio::test]
    async fn test_pod_filter_accepts_vm_and_novnc_roles() {
        assert!(pod_event_filter(&make_pod("v1-a1b2c", "v1", ROLE_VM)));
        assert!(pod_event_filter(&make_pod("v1-novnc", "v1", ROLE_NOVNC)));
        assert!(!pod_event_filter(&make_pod("v1-migrate", "v1", ROLE_MIGRATE)));

        // Foreign pods carry no application tag.
        let mut foreign = make_pod("other", "other", ROLE_VM);
        foreign.metadata.labels = None;
        assert!(!pod_event_filter(&foreign));
    }

    #[tokio::test]
    async fn test_job_filter_requires_app_label() {
        assert!(job_event_filter(&make_job("v1-migrate", "v1")));

        let mut foreign = make_job("backup", "backup");
        foreign.metadata.labels = None;
        assert!(!job_event_filter(&foreign));
    }

    #[tokio::test]
    async fn test_delete_event_with_stale_pod_still_enqueues() {
        let queues = Queues::new();
        let mut pod = make_pod("v1-a1b2c", "v1", ROLE_VM);
        pod.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                k8s_openapi::chrono::Utc::now(),
            ));

        dispatch_pod_event(&watcher::Event::Delete(pod), &queues);

        assert_eq!(queues.pods.get().await.as_deref(), Some("v1-a1b2c"));
    }

    #[tokio::test]
    async fn test_migration_pod_events_are_ignored() {
        let queues = Queues::new();
        dispatch_pod_event(
            &watcher::Event::Apply(make_pod("v1-migrate", "v1", ROLE_MIGRATE)),
            &queues,
        );
        assert!(queues.pods.is_empty());
    }
}
