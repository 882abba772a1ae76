//! Step markers on stdout and the final report.

use crate::bootstrap::BootstrapOutcome;
use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::release::ReleaseOutcome;
use crate::store::StoreReport;
use crate::vault::CredentialKey;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, error};

pub const CONSOLE_SERVICE: &str = "orkestra-console";
const HTTPS_PORT_NAME: &str = "https";

/// Run one named step, printing its start and its result.
pub async fn step<T, F, D>(name: &str, fut: F, describe: D) -> Result<T>
where
    F: Future<Output = Result<T>>,
    D: FnOnce(&T) -> String,
{
    println!("==> {name}");
    match fut.await {
        Ok(value) => {
            println!("[ok] {name}: {}", describe(&value));
            Ok(value)
        }
        Err(e) => {
            println!("[failed] {name}: {e}");
            error!(msg = "step failed", step = name, error = ?e);
            Err(e)
        }
    }
}

/// External URL of the console as exposed by its service.
pub fn endpoint_from_service(service: Option<&Service>, domain: &str) -> String {
    let fallback = format!("https://{domain}");
    let Some(service) = service else {
        return fallback;
    };
    let spec = service.spec.as_ref();
    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first());
    match spec.and_then(|s| s.type_.as_deref()) {
        Some("LoadBalancer") => ingress
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
            .map(|address| format!("https://{address}"))
            .unwrap_or(fallback),
        Some("NodePort") => {
            let ports = spec.and_then(|s| s.ports.as_ref());
            let port = ports.and_then(|ports| {
                ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(HTTPS_PORT_NAME))
                    .or_else(|| ports.first())
                    .and_then(|p| p.node_port)
            });
            port.map(|port| format!("https://{domain}:{port}"))
                .unwrap_or(fallback)
        }
        _ => fallback,
    }
}

pub async fn discover_endpoint<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    domain: &str,
) -> Result<String> {
    let service = cluster.get_service(namespace, CONSOLE_SERVICE).await?;
    let endpoint = endpoint_from_service(service.as_ref(), domain);
    debug!(msg = "endpoint discovered", endpoint);
    Ok(endpoint)
}

/// Summary of a successful convergence.
#[derive(Clone, Debug)]
pub struct ConvergeReport {
    pub endpoint: String,
    pub admin_email: String,
    pub credentials_file: PathBuf,
    pub values_file: PathBuf,
    /// Passwords in effect after the run, as recorded in the credential record.
    pub credentials: BTreeMap<CredentialKey, String>,
    pub stores: Vec<StoreReport>,
    pub release: ReleaseOutcome,
    pub bootstrap: BootstrapOutcome,
}

impl fmt::Display for ConvergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Orkestra is ready ===")?;
        writeln!(f, "Console:      {}", self.endpoint)?;
        writeln!(f, "Admin:        {} ({})", self.admin_email, self.bootstrap)?;
        writeln!(f, "Release:      {}", self.release)?;
        for store in &self.stores {
            writeln!(f, "Store:        {store}")?;
        }
        writeln!(f, "Passwords:")?;
        for (key, password) in &self.credentials {
            writeln!(f, "  {:<20}{password}", key.as_str())?;
        }
        writeln!(
            f,
            "Credentials:  {} (keep this file private)",
            self.credentials_file.display()
        )?;
        write!(f, "Values:       {}", self.values_file.display())
    }
}
