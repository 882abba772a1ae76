//! Removal of a deployment, for `orkestra teardown`.

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::helm::PackageManager;
use crate::lock::InstallLock;
use crate::release::APP_RELEASE;
use crate::report::step;
use crate::secret::CATALOG;
use crate::settings::Settings;
use crate::store::StoreKind;

use std::fmt;
use std::path::PathBuf;

use tracing::{info, instrument, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub uninstalled: Vec<&'static str>,
    pub secrets_deleted: Vec<&'static str>,
    pub purged: Vec<PathBuf>,
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Orkestra removed ===")?;
        writeln!(f, "Releases:     {}", list_or_none(&self.uninstalled))?;
        writeln!(f, "Secrets:      {}", list_or_none(&self.secrets_deleted))?;
        if self.purged.is_empty() {
            write!(f, "Credentials:  kept")
        } else {
            let purged = self
                .purged
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>();
            write!(f, "Purged:       {}", purged.join(", "))
        }
    }
}

fn list_or_none(items: &[&str]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Uninstall every release and delete the catalog secrets. The credential record and the
/// values document are only removed with `purge_credentials`.
#[instrument(skip_all, fields(namespace = %settings.namespace))]
pub async fn teardown<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    settings: &Settings,
    purge_credentials: bool,
) -> Result<TeardownReport> {
    step("prerequisites", helm.check(), |_| "helm available".to_string()).await?;
    let lock = step(
        "install lock",
        InstallLock::acquire(cluster, &settings.namespace, settings.lease_duration),
        |lock| format!("held by {}", lock.holder()),
    )
    .await?;

    let result = lock
        .hold(cluster, run(cluster, helm, settings, purge_credentials))
        .await;

    if let Err(e) = lock.release(cluster).await {
        warn!(msg = "failed to release install lock", %e);
    }
    result
}

async fn run<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    settings: &Settings,
    purge_credentials: bool,
) -> Result<TeardownReport> {
    let namespace = settings.namespace.as_str();
    let mut report = TeardownReport::default();

    // application first, it holds connections to both stores
    let releases = std::iter::once(APP_RELEASE).chain(StoreKind::ALL.map(|k| k.release()));
    for release in releases {
        let removed = step(
            &format!("uninstall {release}"),
            async {
                if helm.status(release, namespace).await?.is_none() {
                    return Ok(false);
                }
                helm.uninstall(release, namespace).await?;
                Ok::<_, Error>(true)
            },
            |removed| if *removed { "removed" } else { "not installed" }.to_string(),
        )
        .await?;
        if removed {
            report.uninstalled.push(release);
        }
    }

    step(
        "secrets",
        async {
            for name in CATALOG {
                if cluster.get_secret(namespace, name).await?.is_some() {
                    cluster.delete_secret(namespace, name).await?;
                    report.secrets_deleted.push(name);
                }
            }
            Ok::<_, Error>(())
        },
        |_| "deleted".to_string(),
    )
    .await?;

    if purge_credentials {
        step(
            "purge credentials",
            async {
                for path in [&settings.credentials_file, &settings.values_file] {
                    if !path.exists() {
                        continue;
                    }
                    std::fs::remove_file(path).map_err(|e| {
                        Error::io(format!("failed to remove {}", path.display()), e)
                    })?;
                    report.purged.push(path.clone());
                }
                Ok::<_, Error>(())
            },
            |_| "done".to_string(),
        )
        .await?;
    }

    info!(
        msg = "teardown finished",
        releases = report.uninstalled.len(),
        secrets = report.secrets_deleted.len()
    );
    Ok(report)
}
