//! The install flow: every step in order, under the install lock.

use crate::bootstrap::configure_admin;
use crate::cluster::ClusterApi;
use crate::context::{DeploymentTarget, InstallContext};
use crate::error::{Error, Result};
use crate::helm::PackageManager;
use crate::lock::InstallLock;
use crate::pki::PkiMaterial;
use crate::release::{await_workloads, converge_release};
use crate::report::{ConvergeReport, discover_endpoint, step};
use crate::secret::{CATALOG, catalog, sync_all};
use crate::settings::Settings;
use crate::store::{StoreKind, converge_store};
use crate::vault::Vault;

use tracing::{info, instrument, warn};

/// Converge the deployment described by `target` onto the cluster.
///
/// Safe to run on a pristine cluster and to re-run after a partial or failed attempt. The
/// lock is released whether the flow succeeds or not.
#[instrument(skip_all, fields(domain = target.domain(), namespace = %settings.namespace))]
pub async fn converge<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    target: DeploymentTarget,
    settings: Settings,
) -> Result<ConvergeReport> {
    step("prerequisites", helm.check(), |_| "helm available".to_string()).await?;
    let namespace = settings.namespace.clone();
    step(
        "namespace",
        async { cluster.ensure_namespace(&namespace).await.map_err(Error::from) },
        |_| namespace.clone(),
    )
    .await?;
    let lock = step(
        "install lock",
        InstallLock::acquire(cluster, &namespace, settings.lease_duration),
        |lock| format!("held by {}", lock.holder()),
    )
    .await?;

    let result = lock.hold(cluster, run(cluster, helm, target, settings)).await;

    if let Err(e) = lock.release(cluster).await {
        warn!(msg = "failed to release install lock", %e);
    }
    result
}

async fn run<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    target: DeploymentTarget,
    settings: Settings,
) -> Result<ConvergeReport> {
    let vault = step(
        "credentials",
        async { Vault::open(&settings.credentials_file, &target) },
        |vault| vault.path().display().to_string(),
    )
    .await?;
    let pki = step(
        "pki material",
        async { PkiMaterial::generate(target.domain(), &settings.namespace) },
        |pki| format!("{} roles generated", pki.len()),
    )
    .await?;
    let mut ctx = InstallContext {
        target,
        vault,
        pki,
        settings,
    };

    step(
        "secrets",
        async {
            let specs = catalog(&ctx)?;
            let gate = ctx.settings.readiness_gate();
            sync_all(cluster, &ctx.settings.namespace, &specs, &gate).await
        },
        |_| CATALOG.join(", "),
    )
    .await?;

    let mut stores = Vec::with_capacity(StoreKind::ALL.len());
    for kind in StoreKind::ALL {
        let report = step(
            &format!("store {kind}"),
            converge_store(cluster, helm, &mut ctx, kind),
            |report| report.to_string(),
        )
        .await?;
        stores.push(report);
    }

    let release = step(
        "application release",
        converge_release(cluster, helm, &ctx),
        |outcome| outcome.to_string(),
    )
    .await?;

    let pods = step("workloads", await_workloads(cluster, &ctx), |pods| {
        format!("running {}", pods.join(", "))
    })
    .await?;
    let control_plane = pods
        .first()
        .ok_or_else(|| Error::MissingData("no control plane pod".to_string()))?;

    let bootstrap = step(
        "admin account",
        configure_admin(cluster, &ctx, control_plane),
        |outcome| outcome.to_string(),
    )
    .await?;

    let endpoint = step(
        "endpoint",
        async {
            let endpoint =
                discover_endpoint(cluster, &ctx.settings.namespace, ctx.target.domain()).await?;
            ctx.vault.set_endpoint(&endpoint)?;
            Ok::<_, Error>(endpoint)
        },
        |endpoint| endpoint.clone(),
    )
    .await?;

    info!(msg = "convergence finished", endpoint);
    Ok(ConvergeReport {
        endpoint,
        admin_email: ctx.target.admin_email().to_string(),
        credentials_file: ctx.vault.path().to_path_buf(),
        values_file: ctx.settings.values_file.clone(),
        credentials: ctx.vault.record().credentials.clone(),
        stores,
        release,
        bootstrap,
    })
}
