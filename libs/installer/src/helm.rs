//! Package manager seam and its Helm implementation.

use crate::error::{Error, Result};
use crate::settings::ChartRef;

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, trace};

const HELM: &str = "helm";

/// Release as reported by the package manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub name: String,
    pub status: String,
    pub revision: u32,
}

/// Arguments shared by install and upgrade.
#[derive(Clone, Copy, Debug)]
pub struct ReleaseRequest<'a> {
    pub release: &'a str,
    pub chart: &'a ChartRef,
    pub namespace: &'a str,
    pub values_file: &'a Path,
    pub timeout: Duration,
}

#[allow(async_fn_in_trait)]
pub trait PackageManager {
    /// Fail when the package manager cannot be run on this host.
    async fn check(&self) -> Result<()>;

    /// Release record, `None` when the release is not installed.
    async fn status(&self, release: &str, namespace: &str) -> Result<Option<ReleaseInfo>>;

    /// Install a release and block until its resources are created.
    async fn install(&self, request: &ReleaseRequest<'_>) -> Result<()>;

    async fn upgrade(&self, request: &ReleaseRequest<'_>) -> Result<()>;

    /// Uninstall a release. A missing release is not an error.
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct Helm {
    kube_context: Option<String>,
    debug: bool,
}

#[derive(Deserialize)]
struct StatusOutput {
    name: String,
    #[serde(default)]
    version: u32,
    info: StatusInfo,
}

#[derive(Deserialize)]
struct StatusInfo {
    status: String,
}

impl Helm {
    pub fn new(kube_context: Option<String>, debug: bool) -> Self {
        Self {
            kube_context,
            debug,
        }
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(context) = &self.kube_context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }

    async fn run(&self, subcommand: &str, args: Vec<String>) -> Result<Output> {
        let args = args.into_iter().chain(self.global_args()).collect::<Vec<_>>();
        trace!(msg = "running helm", ?args);
        Command::new(HELM)
            .args(&args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => prerequisite_error(),
                _ => Error::io(format!("failed to execute helm {subcommand}"), e),
            })
    }

    async fn run_checked(&self, subcommand: &str, args: Vec<String>) -> Result<String> {
        let output = self.run(subcommand, args).await?;
        if !output.status.success() {
            return Err(Error::HelmError {
                command: subcommand.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn prerequisite_error() -> Error {
    Error::PrerequisiteNotFound {
        tool: HELM.to_string(),
        hint: "install it from https://helm.sh/docs/intro/install/".to_string(),
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.to_lowercase().contains("not found")
}

fn parse_status(stdout: &str) -> Result<ReleaseInfo> {
    let status: StatusOutput = serde_json::from_str(stdout).map_err(|e| {
        Error::SerializationError("failed to parse helm status output".to_string(), e)
    })?;
    Ok(ReleaseInfo {
        name: status.name,
        status: status.info.status,
        revision: status.version,
    })
}

/// Arguments of `helm install` / `helm upgrade` for a request.
pub fn release_args(subcommand: &str, request: &ReleaseRequest<'_>) -> Vec<String> {
    let mut args = vec![
        subcommand.to_string(),
        request.release.to_string(),
        request.chart.chart.clone(),
        "--namespace".to_string(),
        request.namespace.to_string(),
        "--values".to_string(),
        request.values_file.display().to_string(),
        "--wait".to_string(),
        "--timeout".to_string(),
        format!("{}s", request.timeout.as_secs()),
    ];
    if subcommand == "install" {
        args.push("--create-namespace".to_string());
    }
    if let Some(version) = &request.chart.version {
        args.push("--version".to_string());
        args.push(version.clone());
    }
    args
}

impl PackageManager for Helm {
    async fn check(&self) -> Result<()> {
        let version = self
            .run_checked("version", vec!["version".to_string(), "--short".to_string()])
            .await?;
        debug!(msg = "helm available", version = version.trim());
        Ok(())
    }

    async fn status(&self, release: &str, namespace: &str) -> Result<Option<ReleaseInfo>> {
        let args = vec![
            "status".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        let output = self.run("status", args).await?;
        if output.status.success() {
            return parse_status(&String::from_utf8_lossy(&output.stdout)).map(Some);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(Error::HelmError {
            command: "status".to_string(),
            message: stderr.trim().to_string(),
        })
    }

    async fn install(&self, request: &ReleaseRequest<'_>) -> Result<()> {
        info!(
            msg = "installing release",
            release = request.release,
            chart = request.chart.chart
        );
        self.run_checked("install", release_args("install", request))
            .await
            .map(|_| ())
    }

    async fn upgrade(&self, request: &ReleaseRequest<'_>) -> Result<()> {
        info!(
            msg = "upgrading release",
            release = request.release,
            chart = request.chart.chart
        );
        self.run_checked("upgrade", release_args("upgrade", request))
            .await
            .map(|_| ())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        let args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--wait".to_string(),
        ];
        let output = self.run("uninstall", args).await?;
        if output.status.success() {
            info!(msg = "release uninstalled", release, namespace);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!(msg = "release already absent", release, namespace);
            return Ok(());
        }
        Err(Error::HelmError {
            command: "uninstall".to_string(),
            message: stderr.trim().to_string(),
        })
    }
}
