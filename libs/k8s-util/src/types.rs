use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

pub const RUNNING_PHASE: &str = "Running";
pub const TERMINATING_PHASE: &str = "Terminating";
pub const UNKNOWN_PHASE: &str = "Unknown";

/// Observed phase of a pod, reporting `Terminating` for pods marked for deletion.
pub fn pod_phase(pod: &Pod) -> String {
    if pod.metadata.deletion_timestamp.is_some() {
        return TERMINATING_PHASE.to_string();
    }
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| UNKNOWN_PHASE.to_string())
}

#[inline]
pub fn is_pod_running(pod: &Pod) -> bool {
    pod_phase(pod) == RUNNING_PHASE
}

/// Running pod whose `Ready` condition is `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    is_pod_running(pod)
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
}

/// Pods sorted by name, the order used to pick a representative pod.
pub fn sorted_by_name(mut pods: Vec<Pod>) -> Vec<Pod> {
    pods.sort_by_key(|p| p.name_any());
    pods
}
