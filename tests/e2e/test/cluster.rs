use super::setup_cluster;

use std::time::Duration;

use orkestra_installer::backoff::BackoffPolicy;
use orkestra_installer::cluster::ClusterApi;
use orkestra_installer::error::Error;
use orkestra_installer::lock::{InstallLock, LOCK_NAME};
use orkestra_installer::probe::{ResourceId, ResourceKind, ResourceState, probe};
use orkestra_installer::readiness::ReadinessGate;
use orkestra_installer::secret::{SecretSpec, sync};

fn gate() -> ReadinessGate {
    ReadinessGate::new(
        30,
        BackoffPolicy::Constant {
            delay: Duration::from_secs(1),
        },
    )
}

#[tokio::test]
async fn lock_excludes_second_holder() {
    let namespace = "e2e-lock";
    let cluster = setup_cluster(namespace).await;

    let lock = InstallLock::acquire_as(&cluster, namespace, Duration::from_secs(600), "e2e/1")
        .await
        .unwrap();
    let err = InstallLock::acquire_as(&cluster, namespace, Duration::from_secs(600), "e2e/2")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockHeld { holder, .. } if holder == "e2e/1"));

    lock.release(&cluster).await.unwrap();
    assert!(
        cluster
            .get_lease(namespace, LOCK_NAME)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn secret_sync_replaces_fields() {
    let namespace = "e2e-secret";
    let cluster = setup_cluster(namespace).await;

    let first = SecretSpec::new("e2e-sync").with_field("a", "1");
    let second = SecretSpec::new("e2e-sync").with_field("b", "2");
    sync(&cluster, namespace, &first, &gate()).await.unwrap();
    sync(&cluster, namespace, &second, &gate()).await.unwrap();

    let secret = cluster
        .get_secret(namespace, "e2e-sync")
        .await
        .unwrap()
        .unwrap();
    let data = secret.data.unwrap();
    assert_eq!(data.keys().collect::<Vec<_>>(), ["b"]);

    cluster.delete_secret(namespace, "e2e-sync").await.unwrap();
}

#[tokio::test]
async fn probe_missing_workload_is_absent() {
    let namespace = "e2e-probe";
    let cluster = setup_cluster(namespace).await;

    let id = ResourceId::new(
        ResourceKind::StatefulSet,
        namespace,
        "app.kubernetes.io/instance=does-not-exist",
    );
    assert_eq!(probe(&cluster, &id).await.unwrap(), ResourceState::Absent);

    let missing_namespace = ResourceId::new(ResourceKind::Deployment, "e2e-no-such-namespace", "a=b");
    assert_eq!(
        probe(&cluster, &missing_namespace).await.unwrap(),
        ResourceState::Absent
    );
}
