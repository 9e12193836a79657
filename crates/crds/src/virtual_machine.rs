//! VirtualMachine CRD
//!
//! The primary resource: a KVM machine the controller keeps scheduled as a
//! compute pod, with optional browser display proxy and live migration.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer placed on every VirtualMachine so dependent resources are
/// confirmed gone before the object itself is removed.
pub const FINALIZER_DELETION: &str = "vmops.io/deletion";

/// Vendor OUI prefix for generated MAC addresses (locally administered).
pub const MAC_OUI: &str = "06:fe";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "vmops.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    status = "VirtualMachineStatus",
    shortname = "vm",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Node", "type":"string", "jsonPath":".status.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Desired lifecycle action
    #[serde(default)]
    pub action: VmAction,

    /// Docker image containing the qcow2 disk image
    pub image: String,

    /// Number of virtual CPUs
    pub cpu: u32,

    /// Memory in MiB
    pub memory_mib: u64,

    /// Desired node placement; empty lets the scheduler choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Backing store for the machine's disk
    #[serde(default)]
    pub volume: VolumeSource,

    /// Credential names whose public keys are injected into the machine
    #[serde(default)]
    pub public_keys: Vec<String>,

    /// Run a browser-based VNC proxy next to the machine
    #[serde(default)]
    pub hosted_novnc: bool,
}

/// Desired lifecycle action.
///
/// Unrecognized wire values deserialize to `Unknown` so the reconciler can
/// surface them instead of failing to decode the whole object.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    /// Keep a compute pod running
    Start,

    /// Tear compute resources down, keep the machine definition
    #[default]
    Stop,

    /// Catch-all for action values this controller does not recognize
    #[serde(other)]
    Unknown,
}

/// Backing store description for the machine's disk.
///
/// Exactly one member is expected to be set; an empty value means a
/// node-local scratch directory.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    /// Node-local scratch directory, lost with the pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,

    /// Longhorn-backed persistent volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longhorn: Option<LonghornVolumeSource>,
}

/// Node-local scratch storage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
pub struct EmptyDirVolumeSource {}

/// Longhorn-backed persistent storage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LonghornVolumeSource {
    /// Size of the qcow2 disk image, e.g. "50Gi"
    pub size: String,

    /// Base image seeding the volume
    #[serde(default)]
    pub base_image: String,

    /// Number of replicas backing the volume
    pub number_of_replicas: u32,

    /// Seconds to wait before replacing an unresponsive replica
    pub stale_replica_timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Observed lifecycle state
    #[serde(default)]
    pub state: VmState,

    /// Stable instance identifier, derived once from the resource UID
    #[serde(default)]
    pub id: String,

    /// MAC address, derived once from the resource UID
    #[serde(default)]
    pub mac: String,

    /// Node the compute pod landed on
    #[serde(default)]
    pub node_name: String,

    /// Host IP of that node
    #[serde(default)]
    pub node_ip: String,
}

/// Observed lifecycle state of a machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    /// Compute pod exists but is not ready yet
    #[default]
    Pending,

    /// Compute pod is ready
    Running,

    /// Dependent deletion in flight
    Stopping,

    /// No compute pod remains
    Stopped,

    /// Machine deletion requested, dependents being cleaned up
    Terminating,

    /// Machine fully removed
    Terminated,

    /// Live migration between nodes in flight
    Migrating,

    /// Reconciliation hit a state requiring external correction
    Error,
}

/// Stable instance identifier for a machine, from the first eight hex
/// digits of its UID.
pub fn instance_id_for(uid: &str) -> String {
    format!("i-{}", uid_hex(uid))
}

/// MAC address for a machine: the vendor OUI followed by four byte-pairs
/// of its UID.
pub fn mac_for(uid: &str) -> String {
    let hex = uid_hex(uid);
    let mut mac = String::from(MAC_OUI);
    for pair in hex.as_bytes().chunks(2) {
        mac.push(':');
        mac.push(pair[0] as char);
        mac.push(pair[1] as char);
    }
    mac
}

/// First eight hex digits of a UID, zero-padded for degenerate inputs.
fn uid_hex(uid: &str) -> String {
    let mut hex: String = uid
        .chars()
        .filter(char::is_ascii_hexdigit)
        .take(8)
        .collect();
    while hex.len() < 8 {
        hex.push('0');
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: &str = "3c2b7b5a-9a04-4e2f-8e1e-1f0a76543210";

    #[test]
    fn test_instance_id_from_uid() {
        assert_eq!(instance_id_for(UID), "i-3c2b7b5a");
    }

    #[test]
    fn test_mac_from_uid() {
        assert_eq!(mac_for(UID), "06:fe:3c:2b:7b:5a");
    }

    #[test]
    fn test_mac_pads_short_uid() {
        assert_eq!(mac_for("ab"), "06:fe:ab:00:00:00");
    }

    #[test]
    fn test_action_unknown_round_trip() {
        let action: VmAction = serde_json::from_str("\"reboot\"").unwrap();
        assert_eq!(action, VmAction::Unknown);
        let action: VmAction = serde_json::from_str("\"start\"").unwrap();
        assert_eq!(action, VmAction::Start);
    }

    #[test]
    fn test_state_serializes_pascal_case() {
        assert_eq!(
            serde_json::to_string(&VmState::Migrating).unwrap(),
            "\"Migrating\""
        );
    }
}
