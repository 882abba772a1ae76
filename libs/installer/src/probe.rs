use crate::cluster::ClusterApi;
use crate::error::Result;

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use orkestra_k8s_util::types::{is_pod_ready, is_pod_running, pod_phase, sorted_by_name};
use tracing::{debug, trace};

/// Workload kind behind a selector. Informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    StatefulSet,
    Deployment,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::StatefulSet => f.write_str("statefulset"),
            ResourceKind::Deployment => f.write_str("deployment"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub namespace: String,
    pub selector: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, namespace: &str, selector: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            selector: selector.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.selector)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Absent,
    Healthy { pod: String },
    Unhealthy { pod: String, phase: String },
}

impl ResourceState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ResourceState::Healthy { .. })
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Absent => f.write_str("absent"),
            ResourceState::Healthy { pod } => write!(f, "healthy ({pod})"),
            ResourceState::Unhealthy { pod, phase } => write!(f, "unhealthy ({pod}: {phase})"),
        }
    }
}

/// Collapse the pods behind a selector into a single state.
///
/// A running pod wins; otherwise the first pod by name is reported with its phase.
pub fn state_from_pods(pods: Vec<Pod>) -> ResourceState {
    let pods = sorted_by_name(pods);
    if let Some(pod) = pods.iter().find(|p| is_pod_running(p)) {
        return ResourceState::Healthy {
            pod: pod.name_any(),
        };
    }
    match pods.first() {
        Some(pod) => ResourceState::Unhealthy {
            pod: pod.name_any(),
            phase: pod_phase(pod),
        },
        None => ResourceState::Absent,
    }
}

/// Observe the current state of a resource. A single query, no retries.
pub async fn probe<C: ClusterApi>(cluster: &C, id: &ResourceId) -> Result<ResourceState> {
    let pods = match cluster.list_pods(&id.namespace, &id.selector).await {
        Ok(pods) => pods,
        Err(e) if e.api_code() == Some(404) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let state = state_from_pods(pods);
    trace!(msg = "resource probed", resource = %id, %state);
    Ok(state)
}

/// Number of running and ready pods behind a selector.
pub async fn ready_pod_count<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    selector: &str,
) -> Result<usize> {
    let pods = match cluster.list_pods(namespace, selector).await {
        Ok(pods) => pods,
        Err(e) if e.api_code() == Some(404) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let ready = pods.iter().filter(|p| is_pod_ready(p)).count();
    debug!(msg = "ready pods counted", namespace, selector, ready);
    Ok(ready)
}
