//! Test utilities for unit testing the reconciler
//!
//! Constructors for VirtualMachine, Pod and Job fixtures in the shapes the
//! controller cares about: alive/terminating, ready/unschedulable,
//! running/finished.

use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::Utc;

use crds::naming::{labels_for, ROLE_MIGRATE};
use crds::{
    instance_id_for, mac_for, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus, VmAction,
    VmState, VolumeSource, FINALIZER_DELETION,
};

/// Fixed UID for fixtures; id/mac derivations are asserted against it.
pub const TEST_UID: &str = "3c2b7b5a-9a04-4e2f-8e1e-1f0a76543210";

/// A fresh VirtualMachine without status or finalizer.
pub fn make_vm(name: &str, action: VmAction) -> VirtualMachine {
    VirtualMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(TEST_UID.to_string()),
            ..Default::default()
        },
        spec: VirtualMachineSpec {
            action,
            image: "vmops/ubuntu:24.04".to_string(),
            cpu: 1,
            memory_mib: 1024,
            node_name: None,
            volume: VolumeSource::default(),
            public_keys: Vec::new(),
            hosted_novnc: false,
        },
        status: None,
    }
}

/// The same machine after its first pass: id, MAC and finalizer assigned.
pub fn make_identified_vm(name: &str, action: VmAction, state: VmState) -> VirtualMachine {
    let mut vm = make_vm(name, action);
    vm.metadata.finalizers = Some(vec![FINALIZER_DELETION.to_string()]);
    vm.status = Some(VirtualMachineStatus {
        state,
        id: instance_id_for(TEST_UID),
        mac: mac_for(TEST_UID),
        node_name: String::new(),
        node_ip: String::new(),
    });
    vm
}

/// A bare pod labeled as a dependent of `vm_name` with the given role.
pub fn make_pod(pod_name: &str, vm_name: &str, role: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            labels: Some(labels_for(vm_name, role)),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        ..Default::default()
    }
}

/// A scheduled, ready compute pod on `node`.
pub fn make_running_pod(pod_name: &str, vm_name: &str, role: &str, node: &str) -> Pod {
    let mut pod = make_pod(pod_name, vm_name, role);
    pod.spec = Some(PodSpec {
        node_name: Some(node.to_string()),
        ..Default::default()
    });
    pod.status = Some(PodStatus {
        host_ip: Some("10.40.0.7".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

/// A pod the scheduler rejected, pinned by affinity to `pinned_node`.
pub fn make_unschedulable_pod(pod_name: &str, vm_name: &str, role: &str, pinned_node: &str) -> Pod {
    let mut vm = make_vm(vm_name, VmAction::Start);
    vm.spec.node_name = Some(pinned_node.to_string());
    let built = crate::resources::build_vm_pod(
        &vm,
        &[],
        &crate::controller::ControllerConfig::default(),
        false,
    );

    let mut pod = make_pod(pod_name, vm_name, role);
    pod.spec = built.spec;
    pod.status = Some(PodStatus {
        conditions: Some(vec![PodCondition {
            type_: "PodScheduled".to_string(),
            status: "False".to_string(),
            reason: Some("Unschedulable".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

/// Mark a pod as terminating.
pub fn mark_deleting(pod: &mut Pod) {
    pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
}

/// A running migration job for `vm_name`.
pub fn make_job(job_name: &str, vm_name: &str) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            labels: Some(labels_for(vm_name, ROLE_MIGRATE)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A migration job that reached a terminal condition.
pub fn make_finished_job(job_name: &str, vm_name: &str, succeeded: bool) -> Job {
    let mut job = make_job(job_name, vm_name);
    job.status = Some(JobStatus {
        conditions: Some(vec![JobCondition {
            type_: if succeeded { "Complete" } else { "Failed" }.to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    job
}
