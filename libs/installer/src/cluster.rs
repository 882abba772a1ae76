//! Kubernetes access used by the installer steps.
//!
//! Every step talks to the cluster through [`ClusterApi`], so the convergence logic can be
//! driven against an in-memory cluster in tests.

use orkestra_k8s_util::client::get_combined_output;
use orkestra_k8s_util::error::{Error, Result};

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use tracing::{debug, trace};

#[allow(async_fn_in_trait)]
pub trait ClusterApi {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// Delete a secret. A missing secret is not an error.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Run `command` in the first container of `pod`, returning stdout followed by stderr.
    async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>) -> Result<String>;

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;

    /// Create a lease. Returns `None` when another writer created it first.
    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Option<Lease>>;

    /// Replace a lease, guarded by its resource version. Returns `None` on conflict.
    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Option<Lease>>;

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()>;

    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == code)
}

impl ClusterApi for KubeCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        match api.list(&ListParams::default().labels(selector)).await {
            Ok(list) => Ok(list.items),
            Err(e) if is_status(&e, 404) => Ok(Vec::new()),
            Err(e) => Err(Error::kube(
                format!("failed to list pods {namespace}/{selector}"),
                e,
            )),
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::kube(format!("failed to get secret {namespace}/{name}"), e))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        api.create(&PostParams::default(), secret)
            .await
            .map_err(|e| Error::kube(format!("failed to create secret {namespace}/{name}"), e))?;
        debug!(msg = "secret created", namespace, name);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(msg = "secret deleted", namespace, name);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(Error::kube(
                format!("failed to delete secret {namespace}/{name}"),
                e,
            )),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api = Api::<Service>::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::kube(format!("failed to get service {namespace}/{name}"), e))
    }

    async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>) -> Result<String> {
        // arguments may carry credentials
        trace!(msg = "pod exec", namespace, pod, program = ?command.first());
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        let attached = api
            .exec(pod, command, &AttachParams::default().stderr(true))
            .await
            .map_err(|e| Error::kube(format!("failed to exec pod {namespace}/{pod}"), e))?;
        get_combined_output(attached).await
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let api = Api::<Lease>::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::kube(format!("failed to get lease {namespace}/{name}"), e))
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Option<Lease>> {
        let api = Api::<Lease>::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), lease).await {
            Ok(created) => Ok(Some(created)),
            Err(e) if is_status(&e, 409) => Ok(None),
            Err(e) => Err(Error::kube(
                format!("failed to create lease in {namespace}"),
                e,
            )),
        }
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Option<Lease>> {
        let api = Api::<Lease>::namespaced(self.client.clone(), namespace);
        let name = lease.metadata.name.as_deref().unwrap_or_default();
        match api.replace(name, &PostParams::default(), lease).await {
            Ok(replaced) => Ok(Some(replaced)),
            Err(e) if is_status(&e, 409) => Ok(None),
            Err(e) => Err(Error::kube(
                format!("failed to replace lease {namespace}/{name}"),
                e,
            )),
        }
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()> {
        let api = Api::<Lease>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(Error::kube(
                format!("failed to delete lease {namespace}/{name}"),
                e,
            )),
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api = Api::<Namespace>::all(self.client.clone());
        let existing = api
            .get_opt(namespace)
            .await
            .map_err(|e| Error::kube(format!("failed to get namespace {namespace}"), e))?;
        if existing.is_some() {
            return Ok(());
        }
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                labels: Some(crate::context::LABELS.clone()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                debug!(msg = "namespace created", namespace);
                Ok(())
            }
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(Error::kube(
                format!("failed to create namespace {namespace}"),
                e,
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use http::{Request, Response};
    use kube::Client;
    use kube::client::Body;
    use serde_json::json;

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    pub fn mock_client() -> (Client, ApiServerHandle) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(mock_service, "default"), handle)
    }

    pub fn status_response(code: u16, reason: &str) -> Response<Body> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code,
        });
        Response::builder()
            .status(code)
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    pub fn json_response(value: serde_json::Value) -> Response<Body> {
        Response::builder()
            .body(Body::from(serde_json::to_vec(&value).unwrap()))
            .unwrap()
    }

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }
}
