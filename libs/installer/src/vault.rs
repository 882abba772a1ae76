use crate::context::DeploymentTarget;
use crate::error::{Error, Result};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const PASSWORD_LENGTH: usize = 32;
const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKey {
    StoreAPassword,
    StoreBPassword,
    AdminPassword,
}

impl CredentialKey {
    pub const ALL: [CredentialKey; 3] = [
        CredentialKey::StoreAPassword,
        CredentialKey::StoreBPassword,
        CredentialKey::AdminPassword,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::StoreAPassword => "store-a-password",
            CredentialKey::StoreBPassword => "store-b-password",
            CredentialKey::AdminPassword => "admin-password",
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of the secrets of a deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub domain: String,
    pub admin_email: String,
    pub credentials: BTreeMap<CredentialKey, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl CredentialRecord {
    fn generate(target: &DeploymentTarget) -> Result<Self> {
        let credentials = CredentialKey::ALL
            .iter()
            .map(|key| generate_password().map(|p| (*key, p)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            domain: target.domain().to_string(),
            admin_email: target.admin_email().to_string(),
            credentials,
            endpoint: None,
        })
    }

    pub fn get(&self, key: CredentialKey) -> &str {
        // every key is filled on open
        self.credentials
            .get(&key)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Random alphanumeric password drawn from the OpenSSL CSPRNG.
///
/// Bytes are rejection sampled so every character of the alphabet is equally likely.
pub fn generate_password() -> Result<String> {
    let limit = (256 / PASSWORD_ALPHABET.len() * PASSWORD_ALPHABET.len()) as u8;
    let mut password = String::with_capacity(PASSWORD_LENGTH);
    let mut buf = [0u8; 64];
    while password.len() < PASSWORD_LENGTH {
        openssl::rand::rand_bytes(&mut buf)
            .map_err(|e| Error::pki("failed to read random bytes", e))?;
        password.extend(
            buf.iter()
                .filter(|b| **b < limit)
                .map(|b| PASSWORD_ALPHABET[*b as usize % PASSWORD_ALPHABET.len()] as char)
                .take(PASSWORD_LENGTH - password.len()),
        );
    }
    Ok(password)
}

/// Local authoritative store of generated secrets, persisted on every change.
///
/// Values are never regenerated once written. They are only replaced when a live store
/// reports a different credential than the one requested.
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    record: CredentialRecord,
}

impl Vault {
    /// Read the record at `path` without creating or repairing it.
    pub fn load(path: &Path) -> Result<Option<CredentialRecord>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        serde_yaml::from_str(&content)
            .map(Some)
            .map_err(|e| Error::YamlError(format!("failed to parse {}", path.display()), e))
    }

    /// Load the record at `path`, creating it with fresh passwords when absent.
    pub fn open(path: &Path, target: &DeploymentTarget) -> Result<Self> {
        let Some(mut record) = Self::load(path)? else {
            info!(msg = "generating credentials", path = %path.display());
            let vault = Self {
                path: path.to_path_buf(),
                record: CredentialRecord::generate(target)?,
            };
            vault.persist()?;
            return Ok(vault);
        };
        debug!(msg = "credentials loaded", path = %path.display());

        let mut dirty = false;
        for key in CredentialKey::ALL {
            if record.credentials.get(&key).is_none_or(|v| v.is_empty()) {
                warn!(msg = "credential missing from record, generating", %key);
                record.credentials.insert(key, generate_password()?);
                dirty = true;
            }
        }
        if record.domain != target.domain() || record.admin_email != target.admin_email() {
            warn!(
                msg = "deployment target changed, keeping existing credentials",
                previous_domain = record.domain,
                domain = target.domain()
            );
            record.domain = target.domain().to_string();
            record.admin_email = target.admin_email().to_string();
            dirty = true;
        }

        let vault = Self {
            path: path.to_path_buf(),
            record,
        };
        if dirty {
            vault.persist()?;
        }
        Ok(vault)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &CredentialRecord {
        &self.record
    }

    pub fn get(&self, key: CredentialKey) -> &str {
        self.record.get(key)
    }

    /// Overwrite a credential, persisting the record. Returns whether the value changed.
    pub fn set(&mut self, key: CredentialKey, value: &str) -> Result<bool> {
        if self.get(key) == value {
            return Ok(false);
        }
        info!(msg = "credential updated from live value", %key);
        self.record.credentials.insert(key, value.to_string());
        self.persist()?;
        Ok(true)
    }

    pub fn set_endpoint(&mut self, endpoint: &str) -> Result<()> {
        if self.record.endpoint.as_deref() == Some(endpoint) {
            return Ok(());
        }
        self.record.endpoint = Some(endpoint.to_string());
        self.persist()
    }

    /// Rewrite the record atomically, readable by the owner only.
    fn persist(&self) -> Result<()> {
        let content = serde_yaml::to_string(&self.record)
            .map_err(|e| Error::YamlError("failed to serialize credentials".to_string(), e))?;
        write_private(&self.path, content.as_bytes())
    }
}

/// Write `content` to `path` through a fresh sibling temporary file. The temporary file is
/// created with mode `0600` on unix, so the replaced record never goes through a wider mode.
pub fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to create temporary file in {}", dir.display()), e))?;
    file.write_all(content)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| Error::io(format!("failed to write {}", file.path().display()), e))?;
    file.persist(path)
        .map(|_| ())
        .map_err(|e| Error::io(format!("failed to replace {}", path.display()), e.error))
}
