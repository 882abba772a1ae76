//! Cluster secrets derived from the credential record and the PKI material.
//!
//! Secrets are never patched: every synchronization deletes the previous object, waits for it
//! to be gone and creates it again, so a synchronized secret holds exactly the fields it was
//! last written with.

use crate::cluster::ClusterApi;
use crate::context::{InstallContext, LABELS};
use crate::error::{Error, Result};
use crate::pki::{PkiMaterial, PkiRole};
use crate::readiness::ReadinessGate;
use crate::store::StoreKind;
use crate::values::store_dsn;
use crate::vault::CredentialRecord;

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use orkestra_k8s_util::annotations::{add_sync_annotations, checksum};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const PKI_SECRET: &str = "orkestra-pki";
pub const DB_SECRET: &str = "orkestra-db";
pub const STORE_TLS_SECRET: &str = "orkestra-store-tls";
pub const METRICS_SECRET: &str = "orkestra-metrics";

pub const CATALOG: [&str; 4] = [PKI_SECRET, DB_SECRET, STORE_TLS_SECRET, METRICS_SECRET];

/// Desired content of a secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretSpec {
    pub name: String,
    pub fields: BTreeMap<String, Vec<u8>>,
}

impl SecretSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn checksum(&self) -> String {
        checksum(&self.fields)
    }

    fn to_secret(&self, namespace: &str) -> Secret {
        let mut annotations = BTreeMap::new();
        add_sync_annotations(&mut annotations, &self.checksum());
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(LABELS.clone()),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            data: Some(
                self.fields
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        }
    }
}

/// Replace a secret with `spec`: delete, wait until it is gone, create.
pub async fn sync<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    spec: &SecretSpec,
    gate: &ReadinessGate,
) -> Result<()> {
    cluster.delete_secret(namespace, &spec.name).await?;

    let gone = gate
        .poll(|attempt| async move {
            match cluster.get_secret(namespace, &spec.name).await {
                Ok(None) => Some(()),
                Ok(Some(_)) => {
                    debug!(msg = "secret still present", name = spec.name, attempt);
                    None
                }
                Err(e) => {
                    warn!(msg = "failed to check secret deletion", name = spec.name, %e);
                    None
                }
            }
        })
        .await;
    if gone.is_none() {
        return Err(Error::ReadinessTimeout {
            resource: format!("deletion of secret {namespace}/{}", spec.name),
            attempts: gate.max_attempts(),
        });
    }

    cluster
        .create_secret(namespace, &spec.to_secret(namespace))
        .await?;
    info!(
        msg = "secret synchronized",
        namespace,
        name = spec.name,
        fields = spec.fields.len()
    );
    Ok(())
}

pub async fn sync_all<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    specs: &[SecretSpec],
    gate: &ReadinessGate,
) -> Result<()> {
    for spec in specs {
        sync(cluster, namespace, spec, gate).await?;
    }
    Ok(())
}

/// The four secrets the application consumes, built from the current context.
pub fn catalog(ctx: &InstallContext) -> Result<Vec<SecretSpec>> {
    let record = ctx.vault.record();
    let namespace = &ctx.settings.namespace;
    Ok(vec![
        pki_secret(&ctx.pki)?,
        db_secret(record, namespace)?,
        store_tls_secret(&ctx.pki)?,
        metrics_secret(record, namespace),
    ])
}

/// Secrets embedding the credential of `kind`.
pub fn dependents_of(
    kind: StoreKind,
    record: &CredentialRecord,
    namespace: &str,
) -> Result<Vec<SecretSpec>> {
    match kind {
        StoreKind::StoreA => Ok(vec![db_secret(record, namespace)?]),
        StoreKind::StoreB => Ok(vec![metrics_secret(record, namespace)]),
    }
}

pub fn pki_secret(pki: &PkiMaterial) -> Result<SecretSpec> {
    let mut operator = pki.cert_pem(PkiRole::Operator)?.to_vec();
    operator.extend_from_slice(pki.key_pem(PkiRole::Operator)?);
    Ok(SecretSpec::new(PKI_SECRET)
        .with_field("ca.crt", pki.cert_pem(PkiRole::RootAuthority)?)
        .with_field("ca.key", pki.key_pem(PkiRole::RootAuthority)?)
        .with_field("endpoint.crt", pki.cert_pem(PkiRole::Endpoint)?)
        .with_field("endpoint.key", pki.key_pem(PkiRole::Endpoint)?)
        .with_field("certifier.crt", pki.cert_pem(PkiRole::Certifier)?)
        .with_field("certifier.key", pki.key_pem(PkiRole::Certifier)?)
        .with_field("bootstrap.key", pki.key_pem(PkiRole::Bootstrap)?)
        .with_field("operator.pem", operator))
}

/// Transport TLS of the stores. The endpoint certificate covers every service name of the
/// namespace.
pub fn store_tls_secret(pki: &PkiMaterial) -> Result<SecretSpec> {
    Ok(SecretSpec::new(STORE_TLS_SECRET)
        .with_field("tls.crt", pki.cert_pem(PkiRole::Endpoint)?)
        .with_field("tls.key", pki.key_pem(PkiRole::Endpoint)?)
        .with_field("ca.crt", pki.cert_pem(PkiRole::RootAuthority)?))
}

#[derive(Serialize)]
struct ServiceEndpoint<'a> {
    name: &'a str,
    engine: &'a str,
    host: String,
    port: u16,
}

pub fn db_secret(record: &CredentialRecord, namespace: &str) -> Result<SecretSpec> {
    let dsn = store_dsn(
        StoreKind::StoreA,
        namespace,
        record.get(StoreKind::StoreA.credential_key()),
    )?;
    let services = StoreKind::ALL
        .iter()
        .map(|kind| ServiceEndpoint {
            name: kind.release(),
            engine: kind.engine(),
            host: kind.host(namespace),
            port: kind.port(),
        })
        .collect::<Vec<_>>();
    let services = serde_json::to_vec(&services).map_err(|e| {
        Error::SerializationError("failed to serialize store services".to_string(), e)
    })?;
    Ok(SecretSpec::new(DB_SECRET)
        .with_field("connection-string", dsn)
        .with_field("services", services))
}

pub fn metrics_secret(record: &CredentialRecord, namespace: &str) -> SecretSpec {
    let kind = StoreKind::StoreB;
    let host = kind.host(namespace);
    let my_cnf = format!(
        "[client]\nuser={}\npassword={}\nhost={host}\nport={}\n",
        kind.username(),
        record.get(kind.credential_key()),
        kind.port()
    );
    SecretSpec::new(METRICS_SECRET)
        .with_field("my.cnf", my_cnf)
        .with_field("endpoint", format!("{host}:{}", kind.port()))
}
