mod cluster;
mod install;

use std::path::Path;
use std::time::Duration;

use orkestra_installer::backoff::BackoffPolicy;
use orkestra_installer::cluster::{ClusterApi, KubeCluster};
use orkestra_installer::settings::Settings;
use orkestra_k8s_util::client::new_client;

pub async fn setup_cluster(namespace: &str) -> KubeCluster {
    let client = new_client(None).await.unwrap();
    let cluster = KubeCluster::new(client);
    cluster.ensure_namespace(namespace).await.unwrap();
    cluster
}

// Settings for a single-node test cluster, with local files kept under `dir`
pub fn e2e_settings(namespace: &str, dir: &Path) -> Settings {
    Settings {
        namespace: namespace.to_string(),
        readiness_attempts: 120,
        readiness_policy: BackoffPolicy::Constant {
            delay: Duration::from_secs(5),
        },
        settle_interval: Duration::from_secs(5),
        credentials_file: dir.join("credentials.yaml"),
        values_file: dir.join("values.yaml"),
        ..Settings::default()
    }
}
