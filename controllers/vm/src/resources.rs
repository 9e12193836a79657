//! Dependent-resource builders.
//!
//! Pure functions from a VirtualMachine spec to the concrete objects the
//! reconciler keeps in existence: the compute pod, the display-proxy
//! pod/service pair and the migration job. Creation and deletion stay in
//! the reconciler; nothing here talks to the control plane.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, HostPathVolumeSource, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, PodTemplateSpec, SecurityContext, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::controller::ControllerConfig;
use crds::naming::{labels_for, LABEL_NODE_HOSTNAME, ROLE_MIGRATE, ROLE_NOVNC, ROLE_VM};
use crds::VirtualMachine;

/// Mount point for the machine's disk image inside the compute pod.
const IMAGE_MOUNT_PATH: &str = "/var/lib/vmops";

/// Port the display proxy serves on.
const NOVNC_PORT: i32 = 6080;

/// Compute pod for a machine.
///
/// Named via `generateName` so a replacement can coexist with its
/// still-terminating predecessor; the owning VM is recovered by stripping
/// the server-generated suffix.
pub fn build_vm_pod(
    vm: &VirtualMachine,
    public_keys: &[String],
    config: &ControllerConfig,
    migrate: bool,
) -> Pod {
    let vm_name = vm.name_any();
    let status = vm.status.clone().unwrap_or_default();

    let mut env = vec![
        env_var("VM_INSTANCE_ID", &status.id),
        env_var("VM_MAC", &status.mac),
        env_var("VM_CPUS", &vm.spec.cpu.to_string()),
        env_var("VM_MEMORY_MIB", &vm.spec.memory_mib.to_string()),
        env_var("VM_BRIDGE_IFACE", &config.bridge_iface),
        env_var("VM_MIGRATE", if migrate { "true" } else { "false" }),
    ];
    if !public_keys.is_empty() {
        env.push(env_var("VM_PUBLIC_KEYS", &public_keys.join("\n")));
    }

    let resources = if config.no_resource_limits {
        None
    } else {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity(vm.spec.cpu.to_string()));
        requests.insert(
            "memory".to_string(),
            Quantity(format!("{}Mi", vm.spec.memory_mib)),
        );
        Some(k8s_openapi::api::core::v1::ResourceRequirements {
            limits: Some(requests.clone()),
            requests: Some(requests),
            ..Default::default()
        })
    };

    let image_volume = match &vm.spec.volume.longhorn {
        Some(_) => Volume {
            name: "vm-image".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: vm_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Volume {
            name: "vm-image".to_string(),
            empty_dir: Some(k8s_openapi::api::core::v1::EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    };

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(config.scheme.vm_pod_prefix(&vm_name)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels_for(&vm_name, ROLE_VM)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "vm".to_string(),
                image: Some(vm.spec.image.clone()),
                env: Some(env),
                resources,
                security_context: Some(SecurityContext {
                    // KVM and bridge setup need device and net admin access.
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![
                    volume_mount("vm-image", IMAGE_MOUNT_PATH),
                    volume_mount("dev", "/dev"),
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                image_volume,
                Volume {
                    name: "dev".to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: "/dev".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            affinity: vm.spec.node_name.as_deref().map(node_affinity),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Display-proxy pod for a machine.
pub fn build_novnc_pod(vm_name: &str, config: &ControllerConfig) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(config.scheme.novnc_pod_name(vm_name)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels_for(vm_name, ROLE_NOVNC)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "novnc".to_string(),
                image: Some(config.novnc_image.clone()),
                env: Some(vec![env_var("VM_NAME", vm_name)]),
                ports: Some(vec![ContainerPort {
                    container_port: NOVNC_PORT,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service exposing a machine's display proxy.
pub fn build_novnc_service(vm_name: &str, config: &ControllerConfig) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(config.scheme.novnc_service_name(vm_name)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels_for(vm_name, ROLE_NOVNC)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels_for(vm_name, ROLE_NOVNC)),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port: NOVNC_PORT,
                target_port: Some(IntOrString::Int(NOVNC_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One-shot job performing the live transfer of a machine to its desired
/// node. The transfer mechanics live in the migration image; the
/// controller only observes the job's terminal condition.
pub fn build_migration_job(vm: &VirtualMachine, config: &ControllerConfig) -> Job {
    let vm_name = vm.name_any();
    let target = vm.spec.node_name.clone().unwrap_or_default();
    let labels = labels_for(&vm_name, ROLE_MIGRATE);
    Job {
        metadata: ObjectMeta {
            name: Some(config.scheme.migration_job_name(&vm_name)),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            completions: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "migrate".to_string(),
                        image: Some(config.migration_image.clone()),
                        env: Some(vec![
                            env_var("VM_NAME", &vm_name),
                            env_var("VM_TARGET_NODE", &target),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn node_affinity(node: &str) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: LABEL_NODE_HOSTNAME.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
