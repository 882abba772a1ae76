//! Helm values documents for the stores and the application release.

use crate::context::InstallContext;
use crate::error::{Error, Result};
use crate::secret::{DB_SECRET, METRICS_SECRET, PKI_SECRET, STORE_TLS_SECRET};
use crate::settings::ServiceType;
use crate::store::StoreKind;
use crate::vault::write_private;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::debug;
use url::Url;

pub const DATABASE_NAME: &str = "orkestra";

/// Connection string of a store, credentials included.
pub fn store_dsn(kind: StoreKind, namespace: &str, password: &str) -> Result<String> {
    let raw = format!(
        "{}://{}:{}/{DATABASE_NAME}",
        kind.scheme(),
        kind.host(namespace),
        kind.port()
    );
    let mut url = Url::parse(&raw)
        .map_err(|e| Error::UrlParseError(format!("failed to parse {raw}"), e))?;
    // safe unwrap: the URL was parsed with a host, credentials can always be set
    url.set_username(kind.username()).unwrap();
    url.set_password(Some(password)).unwrap();
    if kind == StoreKind::StoreA {
        url.query_pairs_mut().append_pair("sslmode", "require");
    }
    Ok(url.to_string())
}

/// Chart values of a store, embedding the password the store is initialized with.
pub fn store_values(kind: StoreKind, ctx: &InstallContext) -> serde_json::Value {
    let password = ctx.vault.get(kind.credential_key());
    // postgresql reads the secret name from `certificatesSecret`, mysql from `existingSecret`
    let secret_key = match kind {
        StoreKind::StoreA => "certificatesSecret",
        StoreKind::StoreB => "existingSecret",
    };
    let tls = json!({
        "enabled": true,
        secret_key: STORE_TLS_SECRET,
        "certFilename": "tls.crt",
        "certKeyFilename": "tls.key",
        "certCAFilename": "ca.crt",
    });
    match kind {
        StoreKind::StoreA => json!({
            "fullnameOverride": kind.release(),
            "auth": {
                "postgresPassword": password,
                "database": DATABASE_NAME,
            },
            "tls": tls,
        }),
        StoreKind::StoreB => json!({
            "fullnameOverride": kind.release(),
            "auth": {
                "rootPassword": password,
                "database": DATABASE_NAME,
            },
            "tls": tls,
        }),
    }
}

/// Write the store values to a private temporary file, removed when dropped.
pub fn write_store_values(kind: StoreKind, ctx: &InstallContext) -> Result<NamedTempFile> {
    let content = serde_yaml::to_string(&store_values(kind, ctx))
        .map_err(|e| Error::YamlError(format!("failed to render {kind} values"), e))?;
    let mut file = tempfile::Builder::new()
        .prefix(&format!("{}-values-", kind.release()))
        .suffix(".yaml")
        .tempfile()
        .map_err(|e| Error::io("failed to create values file", e))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| Error::io(format!("failed to write {}", file.path().display()), e))?;
    Ok(file)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppValues {
    pub global: GlobalValues,
    pub admin: AdminValues,
    pub control_plane: ComponentValues,
    pub console: ComponentValues,
    pub stores: BTreeMap<String, StoreValues>,
    pub secrets: SecretNames,
}

#[derive(Debug, Serialize)]
pub struct GlobalValues {
    pub domain: String,
}

#[derive(Debug, Serialize)]
pub struct AdminValues {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ComponentValues {
    pub service: ServiceValues,
}

#[derive(Debug, Serialize)]
pub struct ServiceValues {
    #[serde(rename = "type")]
    pub type_: ServiceType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreValues {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connection_string: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretNames {
    pub pki: String,
    pub database: String,
    pub store_tls: String,
    pub metrics: String,
}

impl AppValues {
    /// Values of the application release, built from the record as it is now.
    pub fn from_context(ctx: &InstallContext) -> Result<Self> {
        let namespace = &ctx.settings.namespace;
        let stores = StoreKind::ALL
            .iter()
            .map(|kind| {
                let password = ctx.vault.get(kind.credential_key());
                Ok((
                    kind.engine().to_string(),
                    StoreValues {
                        host: kind.host(namespace),
                        port: kind.port(),
                        database: DATABASE_NAME.to_string(),
                        username: kind.username().to_string(),
                        password: password.to_string(),
                        connection_string: store_dsn(*kind, namespace, password)?,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let service = || ComponentValues {
            service: ServiceValues {
                type_: ctx.settings.service_type,
            },
        };
        Ok(Self {
            global: GlobalValues {
                domain: ctx.target.domain().to_string(),
            },
            admin: AdminValues {
                email: ctx.target.admin_email().to_string(),
            },
            control_plane: service(),
            console: service(),
            stores,
            secrets: SecretNames {
                pki: PKI_SECRET.to_string(),
                database: DB_SECRET.to_string(),
                store_tls: STORE_TLS_SECRET.to_string(),
                metrics: METRICS_SECRET.to_string(),
            },
        })
    }
}

/// Render the application values document to the configured path, readable by the owner
/// only. The admin password is not part of it.
pub fn write_app_values(ctx: &InstallContext) -> Result<PathBuf> {
    let values = AppValues::from_context(ctx)?;
    let content = serde_yaml::to_string(&values)
        .map_err(|e| Error::YamlError("failed to render application values".to_string(), e))?;
    let path = ctx.settings.values_file.clone();
    write_private(&path, content.as_bytes())?;
    debug!(msg = "application values written", path = %path.display());
    Ok(path)
}

/// Password a store was installed with, as found in a values document.
pub fn password_from_values(kind: StoreKind, values: &serde_yaml::Value) -> Option<String> {
    let key = match kind {
        StoreKind::StoreA => "postgresPassword",
        StoreKind::StoreB => "rootPassword",
    };
    values
        .get("auth")
        .and_then(|auth| auth.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
