//! Helper predicates over pods and jobs used by the reconciler.
//!
//! All of these read observed state only; none of them touch the control
//! plane.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;

use crds::naming::LABEL_NODE_HOSTNAME;

/// Pods without a pending deletion marker.
pub fn alive_pods(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .collect()
}

/// Whether the pod reports the Ready condition true.
#[must_use]
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the scheduler reported the pod unschedulable.
#[must_use]
pub fn is_pod_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
}

/// The single node a pod's required node affinity pins it to, if the
/// affinity has exactly that shape (one term, one hostname In-expression,
/// one value).
#[must_use]
pub fn required_affinity_node(pod: &Pod) -> Option<&str> {
    let terms = &pod
        .spec
        .as_ref()?
        .affinity
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?
        .node_selector_terms;
    if terms.len() != 1 {
        return None;
    }
    let expressions = terms[0].match_expressions.as_ref()?;
    if expressions.len() != 1 {
        return None;
    }
    let requirement = &expressions[0];
    if requirement.key != LABEL_NODE_HOSTNAME || requirement.operator != "In" {
        return None;
    }
    match requirement.values.as_deref() {
        Some([node]) => Some(node),
        _ => None,
    }
}

/// Node the pod actually runs on.
#[must_use]
pub fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

/// Whether the job reached a terminal condition, successfully or not.
#[must_use]
pub fn is_job_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        })
}
