//! Convergence of the two backing stores.
//!
//! A store is installed fresh, repaired (uninstall, settle, install) or left alone. A
//! healthy store is the authority on its own credential: whatever password it actually runs
//! with replaces the one in the record, and every secret embedding it is re-synchronized.

use crate::cluster::ClusterApi;
use crate::context::{INSTANCE_LABEL, InstallContext};
use crate::error::Result;
use crate::helm::{PackageManager, ReleaseRequest};
use crate::probe::{ResourceId, ResourceKind, ResourceState, probe};
use crate::secret::{dependents_of, sync_all};
use crate::settings::{ChartRef, Settings};
use crate::values::write_store_values;
use crate::vault::CredentialKey;

use std::fmt;

use tracing::{debug, info, instrument, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// PostgreSQL, backing the control plane.
    StoreA,
    /// MySQL, backing the console.
    StoreB,
}

impl StoreKind {
    pub const ALL: [StoreKind; 2] = [StoreKind::StoreA, StoreKind::StoreB];

    pub fn release(&self) -> &'static str {
        match self {
            StoreKind::StoreA => "orkestra-postgresql",
            StoreKind::StoreB => "orkestra-mysql",
        }
    }

    pub fn engine(&self) -> &'static str {
        match self {
            StoreKind::StoreA => "postgresql",
            StoreKind::StoreB => "mysql",
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            StoreKind::StoreA => "postgresql",
            StoreKind::StoreB => "mysql",
        }
    }

    pub fn credential_key(&self) -> CredentialKey {
        match self {
            StoreKind::StoreA => CredentialKey::StoreAPassword,
            StoreKind::StoreB => CredentialKey::StoreBPassword,
        }
    }

    /// Secret the chart creates with the live credential; named after the release.
    pub fn secret_name(&self) -> &'static str {
        self.release()
    }

    pub fn secret_key(&self) -> &'static str {
        match self {
            StoreKind::StoreA => "postgres-password",
            StoreKind::StoreB => "mysql-root-password",
        }
    }

    pub fn username(&self) -> &'static str {
        match self {
            StoreKind::StoreA => "postgres",
            StoreKind::StoreB => "root",
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            StoreKind::StoreA => 5432,
            StoreKind::StoreB => 3306,
        }
    }

    pub fn chart<'a>(&self, settings: &'a Settings) -> &'a ChartRef {
        match self {
            StoreKind::StoreA => &settings.store_a_chart,
            StoreKind::StoreB => &settings.store_b_chart,
        }
    }

    pub fn host(&self, namespace: &str) -> String {
        format!("{}.{namespace}.svc.cluster.local", self.release())
    }

    pub fn selector(&self) -> String {
        format!("{INSTANCE_LABEL}={}", self.release())
    }

    pub fn resource_id(&self, namespace: &str) -> ResourceId {
        ResourceId::new(ResourceKind::StatefulSet, namespace, self.selector())
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.release())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreAction {
    FreshInstall,
    Reconcile,
    Repair,
}

/// Action for a store given its observed state and whether a release record exists.
pub fn decide(state: &ResourceState, release_recorded: bool) -> StoreAction {
    match state {
        ResourceState::Absent if release_recorded => StoreAction::Repair,
        ResourceState::Absent => StoreAction::FreshInstall,
        ResourceState::Healthy { .. } => StoreAction::Reconcile,
        ResourceState::Unhealthy { .. } => StoreAction::Repair,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Installed,
    Reconciled,
    Reinstalled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreReport {
    pub kind: StoreKind,
    pub outcome: StoreOutcome,
    pub credential_changed: bool,
}

impl fmt::Display for StoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.outcome {
            StoreOutcome::Installed => "installed",
            StoreOutcome::Reconciled => "already running",
            StoreOutcome::Reinstalled => "reinstalled",
        };
        write!(f, "{} {outcome}", self.kind)?;
        if self.credential_changed {
            f.write_str(", credential updated from live store")?;
        }
        Ok(())
    }
}

/// Credential the store actually runs with, read from the secret its chart maintains.
pub async fn read_live_credential<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    kind: StoreKind,
) -> Result<Option<String>> {
    let secret = cluster.get_secret(namespace, kind.secret_name()).await?;
    let value = secret
        .and_then(|s| s.data)
        .and_then(|mut data| data.remove(kind.secret_key()))
        .and_then(|bytes| String::from_utf8(bytes.0).ok())
        .filter(|v| !v.is_empty());
    Ok(value)
}

/// Align the record with the live credential and re-synchronize the dependents.
///
/// Returns whether the record changed, or `None` when the live credential is unreadable.
async fn reconcile_credential<C: ClusterApi>(
    cluster: &C,
    ctx: &mut InstallContext,
    kind: StoreKind,
) -> Result<Option<bool>> {
    let namespace = ctx.settings.namespace.clone();
    let Some(live) = read_live_credential(cluster, &namespace, kind).await? else {
        return Ok(None);
    };
    let changed = ctx.vault.set(kind.credential_key(), &live)?;
    if changed {
        warn!(
            msg = "store runs with a different credential than recorded, record updated",
            store = %kind
        );
    }
    sync_dependents(cluster, ctx, kind).await?;
    Ok(Some(changed))
}

async fn sync_dependents<C: ClusterApi>(
    cluster: &C,
    ctx: &InstallContext,
    kind: StoreKind,
) -> Result<()> {
    let dependents = dependents_of(kind, ctx.vault.record(), &ctx.settings.namespace)?;
    sync_all(
        cluster,
        &ctx.settings.namespace,
        &dependents,
        &ctx.settings.readiness_gate(),
    )
    .await
}

async fn uninstall_and_settle<P: PackageManager>(
    helm: &P,
    ctx: &InstallContext,
    kind: StoreKind,
) -> Result<()> {
    helm.uninstall(kind.release(), &ctx.settings.namespace).await?;
    ctx.settings.settle().await;
    Ok(())
}

/// Install the store, wait for it, then reconcile the credential it came up with.
async fn fresh_install<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    ctx: &mut InstallContext,
    kind: StoreKind,
) -> Result<bool> {
    let values = write_store_values(kind, ctx)?;
    let request = ReleaseRequest {
        release: kind.release(),
        chart: kind.chart(&ctx.settings),
        namespace: &ctx.settings.namespace,
        values_file: values.path(),
        timeout: ctx.settings.helm_timeout,
    };
    helm.install(&request).await?;
    drop(values);

    let id = kind.resource_id(&ctx.settings.namespace);
    ctx.settings.readiness_gate().require(cluster, &id).await?;

    match reconcile_credential(cluster, ctx, kind).await? {
        Some(changed) => Ok(changed),
        None => {
            warn!(
                msg = "credential secret unreadable after install, keeping recorded value",
                store = %kind
            );
            sync_dependents(cluster, ctx, kind).await?;
            Ok(false)
        }
    }
}

#[instrument(skip_all, fields(store = %kind))]
pub async fn converge_store<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    ctx: &mut InstallContext,
    kind: StoreKind,
) -> Result<StoreReport> {
    let namespace = ctx.settings.namespace.clone();
    let state = probe(cluster, &kind.resource_id(&namespace)).await?;
    let recorded = helm.status(kind.release(), &namespace).await?.is_some();
    let action = decide(&state, recorded);
    debug!(msg = "store action decided", %state, recorded, ?action);

    let report = |outcome, credential_changed| StoreReport {
        kind,
        outcome,
        credential_changed,
    };
    match action {
        StoreAction::Reconcile => {
            if let Some(changed) = reconcile_credential(cluster, ctx, kind).await? {
                info!(msg = "store healthy, installation skipped", credential_changed = changed);
                return Ok(report(StoreOutcome::Reconciled, changed));
            }
            warn!(msg = "store healthy but its credential is unreadable, reinstalling");
            uninstall_and_settle(helm, ctx, kind).await?;
            let changed = fresh_install(cluster, helm, ctx, kind).await?;
            Ok(report(StoreOutcome::Reinstalled, changed))
        }
        StoreAction::Repair => {
            warn!(msg = "store needs repair, reinstalling", %state, recorded);
            uninstall_and_settle(helm, ctx, kind).await?;
            let changed = fresh_install(cluster, helm, ctx, kind).await?;
            Ok(report(StoreOutcome::Reinstalled, changed))
        }
        StoreAction::FreshInstall => {
            let changed = fresh_install(cluster, helm, ctx, kind).await?;
            Ok(report(StoreOutcome::Installed, changed))
        }
    }
}
