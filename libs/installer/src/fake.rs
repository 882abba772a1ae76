//! In-memory cluster and package manager for tests.
//!
//! Installing a release materializes what its chart would create: store pods and the store
//! credential secret (taken from the values file), or the application workloads and the
//! console service. A store password can be pinned to simulate a data volume that outlives
//! the release.

use crate::cluster::ClusterApi;
use crate::context::{COMPONENT_LABEL, DeploymentTarget, INSTANCE_LABEL, InstallContext};
use crate::error::{Error, Result};
use crate::helm::{PackageManager, ReleaseInfo, ReleaseRequest};
use crate::pki::PkiMaterial;
use crate::release::{APP_RELEASE, CONSOLE_COMPONENT, CONTROL_PLANE_COMPONENT};
use crate::report::CONSOLE_SERVICE;
use crate::settings::Settings;
use crate::store::StoreKind;
use crate::values::password_from_values;
use crate::vault::Vault;
use crate::backoff::BackoffPolicy;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use k8s_openapi::ByteString;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    Pod, PodCondition, PodStatus, Secret, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use orkestra_k8s_util::error::{Error as ClusterError, Result as ClusterResult};
use parking_lot::Mutex;
use tempfile::TempDir;

const NODE_PORT: i32 = 30443;

pub fn pod(name: &str, phase: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        status: Some(pod_status(phase)),
        ..Pod::default()
    }
}

fn pod_status(phase: &str) -> PodStatus {
    PodStatus {
        phase: Some(phase.to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if phase == "Running" { "True" } else { "False" }.to_string(),
            ..PodCondition::default()
        }]),
        ..PodStatus::default()
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|l| l == v),
            None => labels.contains_key(term),
        })
}

pub fn test_settings(dir: &Path) -> Settings {
    Settings {
        readiness_attempts: 3,
        readiness_policy: BackoffPolicy::Constant {
            delay: Duration::from_secs(1),
        },
        settle_interval: Duration::from_secs(1),
        credentials_file: dir.join("credentials.yaml"),
        values_file: dir.join("values.yaml"),
        ..Settings::default()
    }
}

pub fn test_context() -> (TempDir, InstallContext) {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let target = DeploymentTarget::new("example.org", "a@b.com").unwrap();
    let vault = Vault::open(&settings.credentials_file, &target).unwrap();
    let pki = PkiMaterial::generate(target.domain(), &settings.namespace).unwrap();
    let ctx = InstallContext {
        target,
        vault,
        pki,
        settings,
    };
    (dir, ctx)
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct World {
    pods: Vec<Pod>,
    secrets: BTreeMap<Key, Secret>,
    services: BTreeMap<Key, Service>,
    leases: BTreeMap<Key, Lease>,
    namespaces: BTreeSet<String>,
    releases: BTreeMap<String, u32>,
    helm_log: Vec<String>,
    exec_log: Vec<Vec<String>>,
    exec_outputs: VecDeque<String>,
    list_calls: usize,
    linger: u32,
    lingering: BTreeMap<Key, u32>,
    retained_passwords: BTreeMap<String, String>,
    never_ready: BTreeSet<String>,
    failing_installs: BTreeSet<String>,
    failing_upgrades: BTreeSet<String>,
    resource_version: u64,
}

impl World {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn add_store(&mut self, namespace: &str, kind: StoreKind, password: &str) {
        let phase = if self.never_ready.contains(kind.release()) {
            "Pending"
        } else {
            "Running"
        };
        let mut store_pod = pod(
            &format!("{}-0", kind.release()),
            phase,
            &[(INSTANCE_LABEL, kind.release())],
        );
        store_pod.metadata.namespace = Some(namespace.to_string());
        self.pods.push(store_pod);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(kind.secret_name().to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                kind.secret_key().to_string(),
                ByteString(password.as_bytes().to_vec()),
            )])),
            ..Secret::default()
        };
        self.secrets
            .insert(key(namespace, kind.secret_name()), secret);
    }

    fn add_app(&mut self, namespace: &str) {
        let phase = if self.never_ready.contains(APP_RELEASE) {
            "Pending"
        } else {
            "Running"
        };
        for component in [CONTROL_PLANE_COMPONENT, CONSOLE_COMPONENT] {
            let mut app_pod = pod(
                &format!("{APP_RELEASE}-{component}-0"),
                phase,
                &[(INSTANCE_LABEL, APP_RELEASE), (COMPONENT_LABEL, component)],
            );
            app_pod.metadata.namespace = Some(namespace.to_string());
            self.pods.push(app_pod);
        }
        let service = Service {
            metadata: ObjectMeta {
                name: Some(CONSOLE_SERVICE.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("https".to_string()),
                    port: 443,
                    node_port: Some(NODE_PORT),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        self.services
            .insert(key(namespace, CONSOLE_SERVICE), service);
    }

    fn remove_release(&mut self, namespace: &str, release: &str) {
        self.releases.remove(release);
        self.pods.retain(|p| {
            p.namespace().as_deref() != Some(namespace)
                || p.labels().get(INSTANCE_LABEL).map(String::as_str) != Some(release)
        });
        self.secrets.remove(&key(namespace, release));
        if release == APP_RELEASE {
            self.services.remove(&key(namespace, CONSOLE_SERVICE));
        }
    }
}

#[derive(Default)]
pub struct FakeCluster {
    world: Mutex<World>,
}

impl FakeCluster {
    pub fn add_pod(&self, namespace: &str, mut pod: Pod) {
        pod.metadata.namespace = Some(namespace.to_string());
        self.world.lock().pods.push(pod);
    }

    /// A healthy store with its release record, running with `password`.
    pub fn run_store(&self, kind: StoreKind, password: &str) {
        let mut world = self.world.lock();
        world.releases.insert(kind.release().to_string(), 1);
        world
            .retained_passwords
            .insert(kind.release().to_string(), password.to_string());
        world.add_store("orkestra", kind, password);
    }

    /// Pin the password a store comes up with, whatever its values say.
    pub fn retain_store_password(&self, kind: StoreKind, password: &str) {
        self.world
            .lock()
            .retained_passwords
            .insert(kind.release().to_string(), password.to_string());
    }

    pub fn set_store_phase(&self, kind: StoreKind, phase: &str) {
        self.set_phase(&kind.selector(), phase);
    }

    pub fn set_component_phase(&self, component: &str, phase: &str) {
        self.set_phase(&format!("{COMPONENT_LABEL}={component}"), phase);
    }

    fn set_phase(&self, selector: &str, phase: &str) {
        let mut world = self.world.lock();
        for p in world.pods.iter_mut().filter(|p| matches_selector(p, selector)) {
            p.status = Some(pod_status(phase));
        }
    }

    pub fn record_release(&self, release: &str) {
        self.world.lock().releases.insert(release.to_string(), 1);
    }

    pub fn never_ready(&self, release: &str) {
        self.world.lock().never_ready.insert(release.to_string());
    }

    pub fn fail_install(&self, release: &str) {
        self.world.lock().failing_installs.insert(release.to_string());
    }

    pub fn fail_upgrade(&self, release: &str) {
        self.world.lock().failing_upgrades.insert(release.to_string());
    }

    pub fn push_exec_output(&self, output: &str) {
        self.world.lock().exec_outputs.push_back(output.to_string());
    }

    /// Keep the next deleted secret readable for `reads` more reads.
    pub fn linger_deletions(&self, reads: u32) {
        self.world.lock().linger = reads;
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        self.world.lock().secrets.remove(&key(namespace, name));
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.world.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn secret_field(&self, namespace: &str, name: &str, field: &str) -> Option<String> {
        self.secret(namespace, name)
            .and_then(|s| s.data)
            .and_then(|mut d| d.remove(field))
            .and_then(|b| String::from_utf8(b.0).ok())
    }

    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.world
            .lock()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.world.lock().leases.get(&key(namespace, name)).cloned()
    }

    pub fn helm_log(&self) -> Vec<String> {
        self.world.lock().helm_log.clone()
    }

    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.world.lock().exec_log.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.world.lock().list_calls
    }
}

impl ClusterApi for FakeCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> ClusterResult<Vec<Pod>> {
        let mut world = self.world.lock();
        world.list_calls += 1;
        Ok(world
            .pods
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| matches_selector(p, selector))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> ClusterResult<Option<Secret>> {
        let mut guard = self.world.lock();
        let world = &mut *guard;
        let k = key(namespace, name);
        if let Some(remaining) = world.lingering.get_mut(&k) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(world.secrets.get(&k).cloned());
            }
            world.lingering.remove(&k);
            world.secrets.remove(&k);
        }
        Ok(world.secrets.get(&k).cloned())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ClusterResult<()> {
        let mut world = self.world.lock();
        let k = key(namespace, &secret.name_any());
        if world.secrets.contains_key(&k) {
            return Err(ClusterError::MissingData(format!(
                "secret {namespace}/{} already exists",
                k.1
            )));
        }
        world.secrets.insert(k, secret.clone());
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut world = self.world.lock();
        let k = key(namespace, name);
        if world.linger > 0 && world.secrets.contains_key(&k) {
            let reads = std::mem::take(&mut world.linger);
            world.lingering.insert(k, reads);
        } else {
            world.secrets.remove(&k);
        }
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> ClusterResult<Option<Service>> {
        Ok(self.world.lock().services.get(&key(namespace, name)).cloned())
    }

    async fn exec(&self, _namespace: &str, _pod: &str, command: Vec<String>) -> ClusterResult<String> {
        let mut world = self.world.lock();
        world.exec_log.push(command);
        Ok(world
            .exec_outputs
            .pop_front()
            .unwrap_or_else(|| "admin created".to_string()))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> ClusterResult<Option<Lease>> {
        Ok(self.world.lock().leases.get(&key(namespace, name)).cloned())
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Option<Lease>> {
        let mut world = self.world.lock();
        let k = key(namespace, &lease.name_any());
        if world.leases.contains_key(&k) {
            return Ok(None);
        }
        let mut created = lease.clone();
        created.metadata.resource_version = Some(world.next_version());
        world.leases.insert(k, created.clone());
        Ok(Some(created))
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> ClusterResult<Option<Lease>> {
        let mut world = self.world.lock();
        let k = key(namespace, &lease.name_any());
        let current = world
            .leases
            .get(&k)
            .and_then(|l| l.metadata.resource_version.clone());
        if current.is_none() || current != lease.metadata.resource_version {
            return Ok(None);
        }
        let mut replaced = lease.clone();
        replaced.metadata.resource_version = Some(world.next_version());
        world.leases.insert(k, replaced.clone());
        Ok(Some(replaced))
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.world.lock().leases.remove(&key(namespace, name));
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<()> {
        self.world.lock().namespaces.insert(namespace.to_string());
        Ok(())
    }
}

fn helm_error(command: &str, message: &str) -> Error {
    Error::HelmError {
        command: command.to_string(),
        message: message.to_string(),
    }
}

impl PackageManager for FakeCluster {
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn status(&self, release: &str, _namespace: &str) -> Result<Option<ReleaseInfo>> {
        Ok(self
            .world
            .lock()
            .releases
            .get(release)
            .map(|revision| ReleaseInfo {
                name: release.to_string(),
                status: "deployed".to_string(),
                revision: *revision,
            }))
    }

    async fn install(&self, request: &ReleaseRequest<'_>) -> Result<()> {
        let values: serde_yaml::Value = std::fs::read_to_string(request.values_file)
            .ok()
            .and_then(|content| serde_yaml::from_str(&content).ok())
            .unwrap_or_default();
        let mut world = self.world.lock();
        world.helm_log.push(format!("install {}", request.release));
        if world.failing_installs.contains(request.release) {
            return Err(helm_error("install", "chart failed to install"));
        }
        if world.releases.contains_key(request.release) {
            return Err(helm_error("install", "cannot re-use a name that is still in use"));
        }
        world.releases.insert(request.release.to_string(), 1);

        if request.release == APP_RELEASE {
            world.add_app(request.namespace);
        } else if let Some(kind) = StoreKind::ALL
            .into_iter()
            .find(|k| k.release() == request.release)
        {
            let password = world
                .retained_passwords
                .get(request.release)
                .cloned()
                .or_else(|| password_from_values(kind, &values))
                .unwrap_or_default();
            world.add_store(request.namespace, kind, &password);
        }
        Ok(())
    }

    async fn upgrade(&self, request: &ReleaseRequest<'_>) -> Result<()> {
        let mut world = self.world.lock();
        world.helm_log.push(format!("upgrade {}", request.release));
        if world.failing_upgrades.contains(request.release) {
            return Err(helm_error("upgrade", "another operation is in progress"));
        }
        match world.releases.get_mut(request.release) {
            Some(revision) => {
                *revision += 1;
                Ok(())
            }
            None => Err(helm_error("upgrade", "release: not found")),
        }
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        let mut world = self.world.lock();
        world.helm_log.push(format!("uninstall {release}"));
        world.remove_release(namespace, release);
        Ok(())
    }
}
