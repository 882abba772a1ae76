//! Read-only view of a deployment, for `orkestra status`.

use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::helm::PackageManager;
use crate::lock::{LOCK_NAME, is_expired, lease_holder};
use crate::probe::{ResourceState, probe};
use crate::release::{REQUIRED_COMPONENTS, ReleaseState, release_state, workload_id};
use crate::secret::{CATALOG, DB_SECRET, METRICS_SECRET, db_secret, metrics_secret};
use crate::settings::Settings;
use crate::store::StoreKind;
use crate::vault::{CredentialRecord, Vault};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use k8s_openapi::jiff::Timestamp;
use orkestra_k8s_util::annotations::{is_in_sync, synced_at};
use tracing::{debug, instrument};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStatus {
    pub kind: StoreKind,
    pub release_recorded: bool,
    pub state: ResourceState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretStatus {
    pub name: &'static str,
    pub present: bool,
    /// Whether the secret matches the credential record. `None` when it cannot be derived
    /// from the record (PKI material, or no record on this host).
    pub in_sync: Option<bool>,
    pub synced_at: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockStatus {
    pub holder: String,
    pub expired: bool,
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub namespace: String,
    pub credentials_file: PathBuf,
    pub credentials_present: bool,
    pub endpoint: Option<String>,
    pub stores: Vec<StoreStatus>,
    pub release: ReleaseState,
    pub workloads: Vec<(&'static str, ResourceState)>,
    pub secrets: Vec<SecretStatus>,
    pub lock: Option<LockStatus>,
}

impl StatusReport {
    /// Everything installed, running and consistent with the credential record.
    pub fn is_healthy(&self) -> bool {
        self.credentials_present
            && self
                .stores
                .iter()
                .all(|s| s.release_recorded && s.state.is_healthy())
            && matches!(self.release, ReleaseState::Installed { ready_pods } if ready_pods > 0)
            && self.workloads.iter().all(|(_, state)| state.is_healthy())
            && self
                .secrets
                .iter()
                .all(|s| s.present && s.in_sync != Some(false))
    }
}

/// Checksums the record-derived secrets should carry.
fn expected_checksums(
    record: &CredentialRecord,
    namespace: &str,
) -> Result<BTreeMap<&'static str, String>> {
    Ok(BTreeMap::from([
        (DB_SECRET, db_secret(record, namespace)?.checksum()),
        (METRICS_SECRET, metrics_secret(record, namespace).checksum()),
    ]))
}

#[instrument(skip_all, fields(namespace = %settings.namespace))]
pub async fn collect_status<C: ClusterApi, P: PackageManager>(
    cluster: &C,
    helm: &P,
    settings: &Settings,
) -> Result<StatusReport> {
    let namespace = settings.namespace.as_str();
    let record = Vault::load(&settings.credentials_file)?;
    let expected = match record.as_ref() {
        Some(record) => expected_checksums(record, namespace)?,
        None => BTreeMap::new(),
    };

    let mut stores = Vec::with_capacity(StoreKind::ALL.len());
    for kind in StoreKind::ALL {
        let release_recorded = helm.status(kind.release(), namespace).await?.is_some();
        let state = probe(cluster, &kind.resource_id(namespace)).await?;
        stores.push(StoreStatus {
            kind,
            release_recorded,
            state,
        });
    }

    let release = release_state(cluster, helm, namespace).await?;
    let mut workloads = Vec::with_capacity(REQUIRED_COMPONENTS.len());
    for component in REQUIRED_COMPONENTS {
        workloads.push((
            component,
            probe(cluster, &workload_id(namespace, component)).await?,
        ));
    }

    let mut secrets = Vec::with_capacity(CATALOG.len());
    for name in CATALOG {
        let secret = cluster.get_secret(namespace, name).await?;
        let in_sync = match (secret.as_ref(), expected.get(name)) {
            (Some(secret), Some(checksum)) => Some(is_in_sync(&secret.metadata, checksum)),
            (None, Some(_)) => Some(false),
            _ => None,
        };
        secrets.push(SecretStatus {
            name,
            present: secret.is_some(),
            in_sync,
            synced_at: secret.as_ref().and_then(|s| synced_at(&s.metadata)),
        });
    }

    let lock = cluster
        .get_lease(namespace, LOCK_NAME)
        .await?
        .map(|lease| LockStatus {
            holder: lease_holder(&lease).unwrap_or("unknown").to_string(),
            expired: is_expired(&lease, Timestamp::now()),
        });

    debug!(msg = "status collected", stores = stores.len(), secrets = secrets.len());
    Ok(StatusReport {
        namespace: namespace.to_string(),
        credentials_file: settings.credentials_file.clone(),
        credentials_present: record.is_some(),
        endpoint: record.and_then(|r| r.endpoint),
        stores,
        release,
        workloads,
        secrets,
        lock,
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Orkestra status ({}) ===", self.namespace)?;
        let credentials = if self.credentials_present {
            "present"
        } else {
            "missing"
        };
        writeln!(
            f,
            "Credentials:  {} ({credentials})",
            self.credentials_file.display()
        )?;
        if let Some(endpoint) = &self.endpoint {
            writeln!(f, "Console:      {endpoint}")?;
        }
        for store in &self.stores {
            let release = if store.release_recorded {
                "release recorded"
            } else {
                "no release"
            };
            writeln!(f, "Store:        {} ({release}): {}", store.kind, store.state)?;
        }
        match self.release {
            ReleaseState::NotInstalled => writeln!(f, "Release:      not installed")?,
            ReleaseState::Installed { ready_pods } => {
                writeln!(f, "Release:      installed, {ready_pods} ready pods")?
            }
        }
        for (component, state) in &self.workloads {
            writeln!(f, "Workload:     {component}: {state}")?;
        }
        for secret in &self.secrets {
            let presence = if secret.present { "present" } else { "missing" };
            let sync = match secret.in_sync {
                Some(true) => ", in sync",
                Some(false) => ", out of sync",
                None => "",
            };
            writeln!(f, "Secret:       {} ({presence}{sync})", secret.name)?;
        }
        match &self.lock {
            Some(lock) if lock.expired => write!(f, "Lock:         expired, last held by {}", lock.holder),
            Some(lock) => write!(f, "Lock:         held by {}", lock.holder),
            None => write!(f, "Lock:         free"),
        }
    }
}
