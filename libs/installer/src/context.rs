use crate::error::{Error, Result};
use crate::pki::PkiMaterial;
use crate::settings::Settings;
use crate::vault::Vault;

use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER_NAME: &str = "orkestra-installer";

pub static LABELS: LazyLock<BTreeMap<String, String>> = LazyLock::new(|| {
    BTreeMap::from([
        (NAME_LABEL.to_string(), "orkestra".to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string()),
    ])
});

/// Where the deployment is exposed and who administers it. Immutable for the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentTarget {
    domain: String,
    admin_email: String,
}

impl DeploymentTarget {
    pub fn new(domain: &str, admin_email: &str) -> Result<Self> {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        let admin_email = admin_email.trim().to_string();
        validate_domain(&domain)?;
        validate_email(&admin_email)?;
        Ok(Self {
            domain,
            admin_email,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn admin_email(&self) -> &str {
        &self.admin_email
    }
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(Error::InvalidTarget("domain is required".to_string()));
    }
    if !domain.contains('.') {
        return Err(Error::InvalidTarget(format!(
            "domain {domain} must be fully qualified"
        )));
    }
    let valid_labels = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !valid_labels || domain.len() > 253 {
        return Err(Error::InvalidTarget(format!(
            "domain {domain} is not a valid DNS name"
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    match email.split_once('@') {
        Some((local, host)) if !local.is_empty() && !host.is_empty() && !host.contains('@') => {
            Ok(())
        }
        _ => Err(Error::InvalidTarget(format!(
            "admin email {email:?} is not a valid address"
        ))),
    }
}

/// State threaded through every convergence step.
///
/// Only the vault is mutable: store installers overwrite credentials with the value a live
/// store actually uses, and the report step records the external endpoint. Every other
/// component reads through a shared reference.
pub struct InstallContext {
    pub target: DeploymentTarget,
    pub vault: Vault,
    pub pki: PkiMaterial,
    pub settings: Settings,
}
