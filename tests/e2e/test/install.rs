use super::{e2e_settings, setup_cluster};

use orkestra_installer::context::DeploymentTarget;
use orkestra_installer::converge::converge;
use orkestra_installer::diagnose::collect_status;
use orkestra_installer::helm::Helm;
use orkestra_installer::release::ReleaseOutcome;
use orkestra_installer::store::StoreOutcome;
use orkestra_installer::teardown::teardown;

#[tokio::test]
async fn install_rerun_and_teardown() {
    let namespace = "e2e-install";
    let cluster = setup_cluster(namespace).await;
    let helm = Helm::new(None, false);
    let dir = tempfile::tempdir().unwrap();
    let target = || DeploymentTarget::new("orkestra.localhost", "admin@orkestra.localhost").unwrap();

    let first = converge(&cluster, &helm, target(), e2e_settings(namespace, dir.path()))
        .await
        .unwrap();
    assert_eq!(first.release, ReleaseOutcome::Installed);
    assert!(first.bootstrap.is_success());

    let second = converge(&cluster, &helm, target(), e2e_settings(namespace, dir.path()))
        .await
        .unwrap();
    assert!(
        second
            .stores
            .iter()
            .all(|s| s.outcome == StoreOutcome::Reconciled && !s.credential_changed)
    );

    let status = collect_status(&cluster, &helm, &e2e_settings(namespace, dir.path()))
        .await
        .unwrap();
    assert!(status.is_healthy(), "{status}");

    let removed = teardown(&cluster, &helm, &e2e_settings(namespace, dir.path()), true)
        .await
        .unwrap();
    assert_eq!(removed.uninstalled.len(), 3);
    assert!(!dir.path().join("credentials.yaml").exists());
}
