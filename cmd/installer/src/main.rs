use orkestra_installer::backoff::{BackoffKind, BackoffPolicy};
use orkestra_installer::cluster::KubeCluster;
use orkestra_installer::context::DeploymentTarget;
use orkestra_installer::converge::converge;
use orkestra_installer::diagnose::collect_status;
use orkestra_installer::helm::Helm;
use orkestra_installer::lock::release_own;
use orkestra_installer::settings::{
    ChartRef, DEFAULT_APP_CHART, DEFAULT_CREDENTIALS_FILE, DEFAULT_NAMESPACE,
    DEFAULT_READINESS_ATTEMPTS, DEFAULT_VALUES_FILE, ServiceType, Settings,
};
use orkestra_installer::teardown::teardown;
use orkestra_installer::telemetry;
use orkestra_k8s_util::client::new_client;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, Subcommand, crate_authors, crate_description, crate_version};
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser, Debug)]
#[command(
    name = "orkestra",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Namespace holding every release, secret and the install lock
    #[arg(long, global = true, default_value = DEFAULT_NAMESPACE, env = "ORKESTRA_NAMESPACE")]
    namespace: String,

    /// Credential record, written with mode 0600
    #[arg(long, global = true, default_value = DEFAULT_CREDENTIALS_FILE, env = "ORKESTRA_CREDENTIALS_FILE")]
    credentials_file: PathBuf,

    /// Generated application values document
    #[arg(long, global = true, default_value = DEFAULT_VALUES_FILE, env = "ORKESTRA_VALUES_FILE")]
    values_file: PathBuf,

    /// Kubeconfig context to use instead of the current one
    #[arg(long, global = true, env = "ORKESTRA_KUBE_CONTEXT")]
    kube_context: Option<String>,

    /// How long the install lock stays valid without renewal. It is renewed every third of
    /// this while a run is in progress. Example: "2m"
    #[arg(long, global = true, default_value = "120s", value_parser = humantime::parse_duration, env = "ORKESTRA_LEASE_DURATION")]
    lease_duration: Duration,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,orkestra_installer=debug"
    #[arg(long, global = true, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, global = true, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// Raise log verbosity; also passes `--debug` to helm
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install Orkestra, or repair and upgrade an existing installation
    Install(InstallArgs),
    /// Print the state of every managed resource without changing anything
    Status,
    /// Uninstall every release and delete the managed secrets
    Teardown {
        /// Also delete the credential record and the values document
        #[arg(long, env = "ORKESTRA_PURGE_CREDENTIALS")]
        purge_credentials: bool,
    },
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Public domain of the deployment
    #[arg(long, env = "ORKESTRA_DOMAIN")]
    domain: String,

    /// Email of the initial admin account
    #[arg(long, env = "ORKESTRA_EMAIL")]
    email: String,

    /// Helm chart of the application release
    #[arg(long, default_value = DEFAULT_APP_CHART, env = "ORKESTRA_CHART")]
    chart: String,

    /// Version of the application chart. Latest when unset
    #[arg(long, env = "ORKESTRA_CHART_VERSION")]
    chart_version: Option<String>,

    /// Service type exposing the console and the control plane
    #[arg(long, value_enum, default_value_t = ServiceType::NodePort, env = "ORKESTRA_SERVICE_TYPE")]
    service_type: ServiceType,

    /// Number of probes before a component is declared not ready
    #[arg(long, default_value_t = DEFAULT_READINESS_ATTEMPTS, env = "ORKESTRA_READINESS_ATTEMPTS")]
    readiness_attempts: u32,

    /// Delay between readiness probes. Example: "5s", "2m"
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration, env = "ORKESTRA_READINESS_INTERVAL")]
    readiness_interval: Duration,

    /// How the delay between readiness probes evolves
    #[arg(long, value_enum, default_value_t = BackoffKind::Constant, env = "ORKESTRA_BACKOFF")]
    backoff: BackoffKind,

    /// Wait after an uninstall before installing again
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration, env = "ORKESTRA_SETTLE_INTERVAL")]
    settle_interval: Duration,

    /// Timeout passed to every helm install and upgrade
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration, env = "ORKESTRA_HELM_TIMEOUT")]
    helm_timeout: Duration,
}

impl Args {
    fn settings(&self) -> Settings {
        let mut settings = Settings {
            namespace: self.namespace.clone(),
            credentials_file: self.credentials_file.clone(),
            values_file: self.values_file.clone(),
            kube_context: self.kube_context.clone(),
            lease_duration: self.lease_duration,
            verbose: self.verbose,
            ..Settings::default()
        };
        if let Command::Install(install) = &self.command {
            settings.app_chart = ChartRef {
                chart: install.chart.clone(),
                version: install.chart_version.clone(),
            };
            settings.service_type = install.service_type;
            settings.readiness_attempts = install.readiness_attempts;
            settings.readiness_policy =
                BackoffPolicy::new(install.backoff, install.readiness_interval);
            settings.settle_interval = install.settle_interval;
            settings.helm_timeout = install.helm_timeout;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &telemetry::filter_for_verbosity(&args.log_filter, args.verbose),
        args.log_format,
    )?;

    let settings = args.settings();
    let namespace = settings.namespace.clone();
    let client = new_client(settings.kube_context.as_deref()).await?;
    let cluster = KubeCluster::new(client);
    let helm = Helm::new(settings.kube_context.clone(), settings.verbose > 0);

    tokio::select! {
        result = execute(args.command, &cluster, &helm, settings) => result,
        _ = shutdown_signal() => {
            tracing::warn!(msg = "interrupted, releasing install lock");
            if let Err(e) = release_own(&cluster, &namespace).await {
                tracing::warn!(msg = "failed to release install lock", %e);
            }
            Err(anyhow!("interrupted"))
        }
    }
}

async fn execute(
    command: Command,
    cluster: &KubeCluster,
    helm: &Helm,
    settings: Settings,
) -> anyhow::Result<()> {
    match command {
        Command::Install(install) => {
            let target = DeploymentTarget::new(&install.domain, &install.email)?;
            let report = converge(cluster, helm, target, settings).await?;
            println!("{report}");
        }
        Command::Status => {
            let report = collect_status(cluster, helm, &settings).await?;
            println!("{report}");
            if !report.is_healthy() {
                tracing::warn!(msg = "deployment is not healthy, run install to repair it");
            }
        }
        Command::Teardown { purge_credentials } => {
            let report = teardown(cluster, helm, &settings, purge_credentials).await?;
            println!("{report}");
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(msg = "failed to listen for Ctrl-C", %e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(msg = "failed to install SIGTERM handler", %e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}
