use crate::backoff::BackoffPolicy;
use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::probe::{ResourceId, ResourceState, probe};

use std::future::Future;

use tracing::{debug, info, warn};

/// Bounded polling of a condition with a backoff between attempts.
#[derive(Clone, Debug)]
pub struct ReadinessGate {
    max_attempts: u32,
    policy: BackoffPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready { pod: String, attempts: u32 },
    Timeout { attempts: u32 },
}

impl ReadinessGate {
    pub fn new(max_attempts: u32, policy: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            policy,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Evaluate `check` until it yields a value, at most `max_attempts` times.
    ///
    /// Returns the value with the attempt that produced it. There is no wait after the last
    /// attempt.
    pub async fn poll<T, F, Fut>(&self, mut check: F) -> Option<(T, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let mut delays = self.policy.delays();
        for attempt in 1..=self.max_attempts {
            if let Some(value) = check(attempt).await {
                return Some((value, attempt));
            }
            if attempt == self.max_attempts {
                break;
            }
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }
        None
    }

    /// Wait until the resource reports a running pod.
    pub async fn await_ready<C: ClusterApi>(&self, cluster: &C, id: &ResourceId) -> Readiness {
        debug!(msg = "waiting for resource", resource = %id, max_attempts = self.max_attempts);
        let max_attempts = self.max_attempts;
        let polled = self
            .poll(|attempt| async move {
                match probe(cluster, id).await {
                    Ok(ResourceState::Healthy { pod }) => Some(pod),
                    Ok(state) => {
                        debug!(msg = "resource not ready", resource = %id, %state, attempt, max_attempts);
                        None
                    }
                    Err(e) => {
                        warn!(msg = "probe failed", resource = %id, attempt, %e);
                        None
                    }
                }
            })
            .await;
        match polled {
            Some((pod, attempts)) => Readiness::Ready { pod, attempts },
            None => Readiness::Timeout {
                attempts: self.max_attempts,
            },
        }
    }

    /// Like [`ReadinessGate::await_ready`], turning a timeout into an error.
    pub async fn require<C: ClusterApi>(&self, cluster: &C, id: &ResourceId) -> Result<String> {
        match self.await_ready(cluster, id).await {
            Readiness::Ready { pod, attempts } => {
                info!(msg = "resource ready", resource = %id, pod, attempts);
                Ok(pod)
            }
            Readiness::Timeout { attempts } => Err(Error::ReadinessTimeout {
                resource: id.to_string(),
                attempts,
            }),
        }
    }
}
