use crate::backoff::{BackoffKind, BackoffPolicy};
use crate::readiness::ReadinessGate;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::Serialize;

pub const DEFAULT_NAMESPACE: &str = "orkestra";
pub const DEFAULT_APP_CHART: &str = "oci://ghcr.io/orkestra-io/charts/orkestra";
pub const DEFAULT_STORE_A_CHART: &str = "oci://registry-1.docker.io/bitnamicharts/postgresql";
pub const DEFAULT_STORE_B_CHART: &str = "oci://registry-1.docker.io/bitnamicharts/mysql";
pub const DEFAULT_CREDENTIALS_FILE: &str = "orkestra-credentials.yaml";
pub const DEFAULT_VALUES_FILE: &str = "orkestra-values.yaml";
pub const DEFAULT_READINESS_ATTEMPTS: u32 = 60;
pub const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HELM_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(120);

/// Kubernetes service type used to expose the console and the control plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
pub enum ServiceType {
    #[default]
    #[value(name = "NodePort")]
    NodePort,
    #[value(name = "LoadBalancer")]
    LoadBalancer,
    #[value(name = "ClusterIP")]
    #[serde(rename = "ClusterIP")]
    ClusterIp,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceType::NodePort => "NodePort",
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::ClusterIp => "ClusterIP",
        };
        f.write_str(name)
    }
}

/// A chart reference passed to the package manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChartRef {
    pub chart: String,
    pub version: Option<String>,
}

impl ChartRef {
    pub fn new(chart: impl Into<String>) -> Self {
        Self {
            chart: chart.into(),
            version: None,
        }
    }
}

/// Run settings shared by every step. Built once from the command line.
#[derive(Clone, Debug)]
pub struct Settings {
    pub namespace: String,
    pub app_chart: ChartRef,
    pub store_a_chart: ChartRef,
    pub store_b_chart: ChartRef,
    pub service_type: ServiceType,
    pub readiness_attempts: u32,
    pub readiness_policy: BackoffPolicy,
    pub settle_interval: Duration,
    pub helm_timeout: Duration,
    pub lease_duration: Duration,
    pub credentials_file: PathBuf,
    pub values_file: PathBuf,
    pub kube_context: Option<String>,
    pub verbose: u8,
}

impl Settings {
    pub fn readiness_gate(&self) -> ReadinessGate {
        ReadinessGate::new(self.readiness_attempts, self.readiness_policy.clone())
    }

    /// Wait after a destructive operation so the platform can release the resources.
    pub async fn settle(&self) {
        tracing::debug!(
            msg = "waiting settle interval",
            seconds = self.settle_interval.as_secs_f64()
        );
        tokio::time::sleep(self.settle_interval).await;
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            app_chart: ChartRef::new(DEFAULT_APP_CHART),
            store_a_chart: ChartRef::new(DEFAULT_STORE_A_CHART),
            store_b_chart: ChartRef::new(DEFAULT_STORE_B_CHART),
            service_type: ServiceType::default(),
            readiness_attempts: DEFAULT_READINESS_ATTEMPTS,
            readiness_policy: BackoffPolicy::new(
                BackoffKind::Constant,
                DEFAULT_READINESS_INTERVAL,
            ),
            settle_interval: DEFAULT_SETTLE_INTERVAL,
            helm_timeout: DEFAULT_HELM_TIMEOUT,
            lease_duration: DEFAULT_LEASE_DURATION,
            credentials_file: PathBuf::from(DEFAULT_CREDENTIALS_FILE),
            values_file: PathBuf::from(DEFAULT_VALUES_FILE),
            kube_context: None,
            verbose: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_serializes_as_kubernetes_name() {
        assert_eq!(
            serde_yaml::to_string(&ServiceType::ClusterIp).unwrap().trim(),
            "ClusterIP"
        );
        assert_eq!(
            serde_yaml::to_string(&ServiceType::NodePort).unwrap().trim(),
            "NodePort"
        );
        assert_eq!(ServiceType::LoadBalancer.to_string(), "LoadBalancer");
    }

    #[test]
    fn test_service_type_from_cli_value() {
        assert_eq!(
            ServiceType::from_str("ClusterIP", false).unwrap(),
            ServiceType::ClusterIp
        );
    }
}
