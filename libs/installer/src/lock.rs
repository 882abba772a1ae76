//! Advisory install lock backed by a coordination Lease.
//!
//! Two runs against the same namespace would race on uninstall/install and on secret
//! replacement. The lock is advisory: it only excludes other runs of this installer.

use crate::cluster::ClusterApi;
use crate::context::LABELS;
use crate::error::{Error, Result};

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::jiff::{Span, Timestamp};
use tracing::{debug, info, warn};

pub const LOCK_NAME: &str = "orkestra-install-lock";

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Identity written in the lease: `<hostname>/<pid>`.
pub fn holder_identity() -> String {
    format!("{}/{}", local_hostname(), std::process::id())
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    std::path::Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Whether `holder` names a process of this host that no longer runs, i.e. an interrupted
/// run that could not release its lease.
pub fn holder_is_gone(holder: &str) -> bool {
    let Some((host, pid)) = holder.rsplit_once('/') else {
        return false;
    };
    if host != local_hostname() {
        return false;
    }
    match pid.parse::<u32>() {
        Ok(pid) => pid != std::process::id() && !process_alive(pid),
        Err(_) => false,
    }
}

pub fn lease_holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref()?.holder_identity.as_deref()
}

/// Whether the holder stopped renewing: last renewal (or acquisition) plus the lease
/// duration is not after `now`. A lease without times has expired.
pub fn is_expired(lease: &Lease, now: Timestamp) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    let Some(MicroTime(last)) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = Span::new().seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    last.checked_add(duration)
        .map(|deadline| deadline <= now)
        .unwrap_or(true)
}

fn lease_spec(holder: &str, duration: Duration, transitions: i32) -> LeaseSpec {
    let now = MicroTime(Timestamp::now());
    LeaseSpec {
        holder_identity: Some(holder.to_string()),
        lease_duration_seconds: Some(i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)),
        acquire_time: Some(now.clone()),
        renew_time: Some(now),
        lease_transitions: Some(transitions),
        ..LeaseSpec::default()
    }
}

async fn current_holder<C: ClusterApi>(cluster: &C, namespace: &str) -> Result<String> {
    Ok(cluster
        .get_lease(namespace, LOCK_NAME)
        .await?
        .as_ref()
        .and_then(lease_holder)
        .unwrap_or("none")
        .to_string())
}

/// A held install lock. Keep it alive with [`InstallLock::hold`] and release it explicitly;
/// dropping it leaves the lease to expire.
#[derive(Debug)]
pub struct InstallLock {
    namespace: String,
    holder: String,
    duration: Duration,
}

impl InstallLock {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquire the lock, taking over an expired lease or one left by a dead local process.
    pub async fn acquire<C: ClusterApi>(
        cluster: &C,
        namespace: &str,
        duration: Duration,
    ) -> Result<Self> {
        Self::acquire_as(cluster, namespace, duration, &holder_identity()).await
    }

    pub async fn acquire_as<C: ClusterApi>(
        cluster: &C,
        namespace: &str,
        duration: Duration,
        holder: &str,
    ) -> Result<Self> {
        let lock = Self {
            namespace: namespace.to_string(),
            holder: holder.to_string(),
            duration,
        };
        let acquired = match cluster.get_lease(namespace, LOCK_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LOCK_NAME.to_string()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(LABELS.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(lease_spec(holder, duration, 0)),
                };
                cluster.create_lease(namespace, &lease).await?.is_some()
            }
            Some(existing) => {
                let current = lease_holder(&existing).unwrap_or_default().to_string();
                if current != holder
                    && !is_expired(&existing, Timestamp::now())
                    && !holder_is_gone(&current)
                {
                    return Err(Error::LockHeld {
                        name: LOCK_NAME.to_string(),
                        holder: current,
                    });
                }
                if current != holder {
                    warn!(msg = "taking over stale install lock", previous_holder = current);
                }
                let transitions = existing
                    .spec
                    .as_ref()
                    .and_then(|s| s.lease_transitions)
                    .unwrap_or(0)
                    + i32::from(current != holder);
                let lease = Lease {
                    metadata: existing.metadata.clone(),
                    spec: Some(lease_spec(holder, duration, transitions)),
                };
                cluster.replace_lease(namespace, &lease).await?.is_some()
            }
        };

        if !acquired {
            // lost a race with another writer
            return Err(Error::LockHeld {
                name: LOCK_NAME.to_string(),
                holder: current_holder(cluster, namespace).await?,
            });
        }
        info!(msg = "install lock acquired", namespace, holder);
        Ok(lock)
    }

    /// Push the lease deadline forward. Fails with [`Error::LockLost`] once another run
    /// owns the lease or it is gone.
    pub async fn renew<C: ClusterApi>(&self, cluster: &C) -> Result<()> {
        let lost = |holder: String| Error::LockLost {
            name: LOCK_NAME.to_string(),
            holder,
        };
        let Some(lease) = cluster.get_lease(&self.namespace, LOCK_NAME).await? else {
            return Err(lost("none".to_string()));
        };
        if lease_holder(&lease) != Some(self.holder.as_str()) {
            return Err(lost(lease_holder(&lease).unwrap_or("none").to_string()));
        }
        let mut renewed = lease;
        let spec = renewed.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(Timestamp::now()));
        spec.lease_duration_seconds =
            Some(i32::try_from(self.duration.as_secs()).unwrap_or(i32::MAX));
        if cluster
            .replace_lease(&self.namespace, &renewed)
            .await?
            .is_none()
        {
            return Err(lost(current_holder(cluster, &self.namespace).await?));
        }
        debug!(msg = "install lock renewed", holder = self.holder);
        Ok(())
    }

    /// Drive `fut` while renewing the lease every third of its duration. Losing the lease
    /// aborts `fut`; other renewal failures are retried on the next tick.
    pub async fn hold<C, F, T>(&self, cluster: &C, fut: F) -> Result<T>
    where
        C: ClusterApi,
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            result = fut => result,
            lost = self.keep_alive(cluster) => Err(lost),
        }
    }

    async fn keep_alive<C: ClusterApi>(&self, cluster: &C) -> Error {
        let interval = (self.duration / 3).max(MIN_RENEW_INTERVAL);
        loop {
            tokio::time::sleep(interval).await;
            match self.renew(cluster).await {
                Ok(()) => {}
                Err(e @ Error::LockLost { .. }) => {
                    warn!(msg = "install lock lost, aborting", %e);
                    return e;
                }
                Err(e) => warn!(msg = "failed to renew install lock", %e),
            }
        }
    }

    /// Delete the lease if this run still holds it.
    pub async fn release<C: ClusterApi>(self, cluster: &C) -> Result<()> {
        match cluster.get_lease(&self.namespace, LOCK_NAME).await? {
            Some(lease) if lease_holder(&lease) == Some(self.holder.as_str()) => {
                cluster.delete_lease(&self.namespace, LOCK_NAME).await?;
                debug!(msg = "install lock released", namespace = self.namespace);
            }
            Some(lease) => {
                warn!(
                    msg = "install lock taken over by another run, leaving it",
                    holder = lease_holder(&lease)
                );
            }
            None => {}
        }
        Ok(())
    }
}

/// Delete the lease when this process holds it. Used when a run is interrupted before it
/// could release its [`InstallLock`].
pub async fn release_own<C: ClusterApi>(cluster: &C, namespace: &str) -> Result<()> {
    let own = holder_identity();
    if let Some(lease) = cluster.get_lease(namespace, LOCK_NAME).await? {
        if lease_holder(&lease) == Some(own.as_str()) {
            cluster.delete_lease(namespace, LOCK_NAME).await?;
            info!(msg = "install lock released after interruption", namespace);
        }
    }
    Ok(())
}
