//! Unit tests for the reconcile_helpers module

use crate::reconcile_helpers::*;
use crate::test_utils::*;
use crds::naming::ROLE_VM;

#[test]
fn test_alive_pods_excludes_terminating() {
    let healthy = make_pod("v1-a", "v1", ROLE_VM);
    let mut terminating = make_pod("v1-b", "v1", ROLE_VM);
    mark_deleting(&mut terminating);

    let pods = vec![healthy, terminating];
    let alive = alive_pods(&pods);

    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].metadata.name.as_deref(), Some("v1-a"));
}

#[test]
fn test_pod_readiness_requires_ready_condition() {
    let ready = make_running_pod("v1-a", "v1", ROLE_VM, "node-a");
    assert!(is_pod_ready(&ready));

    // Scheduled but not yet ready.
    let pending = make_pod("v1-b", "v1", ROLE_VM);
    assert!(!is_pod_ready(&pending));
}

#[test]
fn test_unschedulable_detection() {
    let stuck = make_unschedulable_pod("v1-a", "v1", ROLE_VM, "node-a");
    assert!(is_pod_unschedulable(&stuck));
    assert!(!is_pod_ready(&stuck));

    let running = make_running_pod("v1-b", "v1", ROLE_VM, "node-a");
    assert!(!is_pod_unschedulable(&running));
}

#[test]
fn test_affinity_node_extraction() {
    let pinned = make_unschedulable_pod("v1-a", "v1", ROLE_VM, "node-a");
    assert_eq!(required_affinity_node(&pinned), Some("node-a"));

    // No affinity at all.
    let free = make_pod("v1-b", "v1", ROLE_VM);
    assert_eq!(required_affinity_node(&free), None);
}

#[test]
fn test_pod_node_reads_spec_placement() {
    let scheduled = make_running_pod("v1-a", "v1", ROLE_VM, "node-a");
    assert_eq!(pod_node(&scheduled), Some("node-a"));

    let unscheduled = make_pod("v1-b", "v1", ROLE_VM);
    assert_eq!(pod_node(&unscheduled), None);
}

#[test]
fn test_job_terminal_states() {
    assert!(!is_job_finished(&make_job("v1-migrate", "v1")));
    assert!(is_job_finished(&make_finished_job("v1-migrate", "v1", true)));
    // A failed transfer is just as finished as a successful one.
    assert!(is_job_finished(&make_finished_job("v1-migrate", "v1", false)));
}
