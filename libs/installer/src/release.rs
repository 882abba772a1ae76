use crate::cluster::ClusterApi;
use crate::context::{COMPONENT_LABEL, INSTANCE_LABEL, InstallContext};
use crate::error::Result;
use crate::helm::{PackageManager, ReleaseRequest};
use crate::probe::{ResourceId, ResourceKind, ready_pod_count};
use crate::values::write_app_values;

use std::fmt;

use tracing::{debug, info, instrument, warn};

pub const APP_RELEASE: &str = "orkestra";
pub const CONTROL_PLANE_COMPONENT: &str = "control-plane";
pub const CONSOLE_COMPONENT: &str = "console";

/// Workloads that must be running before the deployment is usable.
pub const REQUIRED_COMPONENTS: [&str; 2] = [CONTROL_PLANE_COMPONENT, CONSOLE_COMPONENT];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseState {
    NotInstalled,
    Installed { ready_pods: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseAction {
    Install,
    Reinstall,
    Upgrade,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Installed,
    Reinstalled,
    Upgraded,
    /// The upgrade command failed but every required workload is still running.
    UpgradeFailedButReady,
}

impl fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseOutcome::Installed => "installed",
            ReleaseOutcome::Reinstalled => "reinstalled",
            ReleaseOutcome::Upgraded => "upgraded",
            ReleaseOutcome::UpgradeFailedButReady => "upgrade failed, previous revision running",
        };
        f.write_str(s)
    }
}

pub fn decide(state: ReleaseState) -> ReleaseAction {
    match state {
        ReleaseState::NotInstalled => ReleaseAction::Install,
        ReleaseState::Installed { ready_pods: 0 } => ReleaseAction::Reinstall,
        ReleaseState::Installed { .. } => ReleaseAction::Upgrade,
    }
}

pub fn app_selector() -> String {
    format!("{INSTANCE_LABEL}={APP_RELEASE}")
}

pub fn workload_id(namespace: &str, component: &str) -> ResourceId {
    ResourceId::new(
        ResourceKind::Deployment,
        namespace,
        format!("{},{COMPONENT_LABEL}={component}", app_selector()),
    )
}

pub async fn release_state<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    namespace: &str,
) -> Result<ReleaseState> {
    if helm.status(APP_RELEASE, namespace).await?.is_none() {
        return Ok(ReleaseState::NotInstalled);
    }
    let ready_pods = ready_pod_count(cluster, namespace, &app_selector()).await?;
    Ok(ReleaseState::Installed { ready_pods })
}

/// Wait for every required workload.
pub async fn await_workloads<C: ClusterApi>(
    cluster: &C,
    ctx: &InstallContext,
) -> Result<Vec<String>> {
    let gate = ctx.settings.readiness_gate();
    let mut pods = Vec::with_capacity(REQUIRED_COMPONENTS.len());
    for component in REQUIRED_COMPONENTS {
        let id = workload_id(&ctx.settings.namespace, component);
        pods.push(gate.require(cluster, &id).await?);
    }
    Ok(pods)
}

#[instrument(skip_all, fields(release = APP_RELEASE))]
pub async fn converge_release<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    ctx: &InstallContext,
) -> Result<ReleaseOutcome> {
    let namespace = &ctx.settings.namespace;
    let state = release_state(cluster, helm, namespace).await?;
    let action = decide(state);
    debug!(msg = "release action decided", ?state, ?action);

    let values_file = write_app_values(ctx)?;
    let request = ReleaseRequest {
        release: APP_RELEASE,
        chart: &ctx.settings.app_chart,
        namespace,
        values_file: &values_file,
        timeout: ctx.settings.helm_timeout,
    };

    match action {
        ReleaseAction::Install => {
            helm.install(&request).await?;
            Ok(ReleaseOutcome::Installed)
        }
        ReleaseAction::Reinstall => {
            warn!(msg = "release has no ready pods, reinstalling");
            helm.uninstall(APP_RELEASE, namespace).await?;
            ctx.settings.settle().await;
            helm.install(&request).await?;
            Ok(ReleaseOutcome::Reinstalled)
        }
        ReleaseAction::Upgrade => match helm.upgrade(&request).await {
            Ok(()) => Ok(ReleaseOutcome::Upgraded),
            Err(e) => {
                warn!(msg = "upgrade failed, checking workloads", %e);
                match await_workloads(cluster, ctx).await {
                    Ok(_) => {
                        info!(msg = "workloads still ready, tolerating failed upgrade");
                        Ok(ReleaseOutcome::UpgradeFailedButReady)
                    }
                    Err(readiness) => {
                        warn!(msg = "workloads not ready after failed upgrade", %readiness);
                        Err(e)
                    }
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fake::{FakeCluster, test_context};

    #[test]
    fn test_decide() {
        assert_eq!(decide(ReleaseState::NotInstalled), ReleaseAction::Install);
        assert_eq!(
            decide(ReleaseState::Installed { ready_pods: 0 }),
            ReleaseAction::Reinstall
        );
        assert_eq!(
            decide(ReleaseState::Installed { ready_pods: 2 }),
            ReleaseAction::Upgrade
        );
    }

    #[test]
    fn test_workload_selector() {
        assert_eq!(
            workload_id("orkestra", CONSOLE_COMPONENT).selector,
            "app.kubernetes.io/instance=orkestra,app.kubernetes.io/component=console"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_then_upgrade() {
        let cluster = FakeCluster::default();
        let (_dir, ctx) = test_context();

        let first = converge_release(&cluster, &cluster, &ctx).await.unwrap();
        let second = converge_release(&cluster, &cluster, &ctx).await.unwrap();

        assert_eq!(first, ReleaseOutcome::Installed);
        assert_eq!(second, ReleaseOutcome::Upgraded);
        assert_eq!(cluster.helm_log(), ["install orkestra", "upgrade orkestra"]);
        assert!(ctx.settings.values_file.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_without_ready_pods_is_reinstalled() {
        let cluster = FakeCluster::default();
        let (_dir, ctx) = test_context();
        cluster.record_release(APP_RELEASE);

        let outcome = converge_release(&cluster, &cluster, &ctx).await.unwrap();

        assert_eq!(outcome, ReleaseOutcome::Reinstalled);
        assert_eq!(
            cluster.helm_log(),
            ["uninstall orkestra", "install orkestra"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upgrade_tolerated_when_ready() {
        let cluster = FakeCluster::default();
        let (_dir, ctx) = test_context();
        converge_release(&cluster, &cluster, &ctx).await.unwrap();
        cluster.fail_upgrade(APP_RELEASE);

        let outcome = converge_release(&cluster, &cluster, &ctx).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::UpgradeFailedButReady);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upgrade_fatal_when_not_ready() {
        let cluster = FakeCluster::default();
        let (_dir, ctx) = test_context();
        converge_release(&cluster, &cluster, &ctx).await.unwrap();
        cluster.fail_upgrade(APP_RELEASE);
        cluster.set_component_phase(CONSOLE_COMPONENT, "Failed");
        // a single ready pod keeps the release in the upgrade path
        let err = converge_release(&cluster, &cluster, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::HelmError { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_failure_is_fatal() {
        let cluster = FakeCluster::default();
        let (_dir, ctx) = test_context();
        cluster.fail_install(APP_RELEASE);

        let err = converge_release(&cluster, &cluster, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::HelmError { .. }));
    }
}
