//! Admin account creation inside the running control plane.

use crate::cluster::ClusterApi;
use crate::context::InstallContext;
use crate::error::{Error, Result};
use crate::vault::CredentialKey;

use std::fmt;

use tracing::{info, instrument, warn};

pub const ADMIN_CLI: &str = "orkestra-ctl";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created,
    AlreadyExists,
    Unknown(String),
}

impl BootstrapOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, BootstrapOutcome::Unknown(_))
    }
}

impl fmt::Display for BootstrapOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapOutcome::Created => f.write_str("admin account created"),
            BootstrapOutcome::AlreadyExists => f.write_str("admin account already exists"),
            BootstrapOutcome::Unknown(_) => f.write_str("unrecognized result"),
        }
    }
}

/// Classify the output of the admin creation command.
///
/// Output mentioning an error or a failure is never taken as a creation, even when it also
/// contains a success word.
pub fn classify(output: &str) -> BootstrapOutcome {
    let lower = output.to_lowercase();
    if lower.contains("already exists") {
        return BootstrapOutcome::AlreadyExists;
    }
    if lower.contains("error") || lower.contains("fail") {
        return BootstrapOutcome::Unknown(output.trim().to_string());
    }
    if lower.contains("created") || lower.contains("success") {
        return BootstrapOutcome::Created;
    }
    BootstrapOutcome::Unknown(output.trim().to_string())
}

pub fn admin_command(email: &str, password: &str, verbose: bool) -> Vec<String> {
    let mut command = [
        ADMIN_CLI, "admin", "create", "--email", email, "--password", password,
    ]
    .map(str::to_string)
    .to_vec();
    if verbose {
        command.push("--verbose".to_string());
    }
    command
}

/// Run the admin creation command once in `pod`.
pub async fn bootstrap_admin<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    pod: &str,
    email: &str,
    password: &str,
    verbose: bool,
) -> Result<BootstrapOutcome> {
    let output = cluster
        .exec(namespace, pod, admin_command(email, password, verbose))
        .await?;
    Ok(classify(&output))
}

/// Ensure the admin account exists, re-running verbosely once when the result is unclear.
#[instrument(skip_all, fields(pod = %pod))]
pub async fn configure_admin<C: ClusterApi>(
    cluster: &C,
    ctx: &InstallContext,
    pod: &str,
) -> Result<BootstrapOutcome> {
    let namespace = &ctx.settings.namespace;
    let email = ctx.target.admin_email();
    let password = ctx.vault.get(CredentialKey::AdminPassword);

    let outcome = bootstrap_admin(cluster, namespace, pod, email, password, false).await?;
    if outcome.is_success() {
        info!(msg = "admin bootstrap finished", %outcome);
        return Ok(outcome);
    }

    warn!(msg = "admin bootstrap result unclear, re-running with diagnostics", ?outcome);
    match bootstrap_admin(cluster, namespace, pod, email, password, true).await? {
        BootstrapOutcome::Unknown(output) => {
            warn!(msg = "admin bootstrap diagnostic output", output);
            Err(Error::AmbiguousBootstrap(output))
        }
        outcome => {
            info!(msg = "admin bootstrap finished on diagnostic run", %outcome);
            Ok(outcome)
        }
    }
}
