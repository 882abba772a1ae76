use crate::error::{Error, Result};

use futures::StreamExt;
use kube::api::AttachedProcess;
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tokio::io::AsyncRead;
use tracing::debug;

/// Build a client from the local kubeconfig, optionally pinned to a context, falling back to
/// the in-cluster configuration when no kubeconfig is present.
pub async fn new_client(context: Option<&str>) -> Result<Client> {
    let config = match context {
        Some(context) => {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                ..KubeConfigOptions::default()
            };
            Config::from_kubeconfig(&options).await.map_err(|e| {
                Error::MissingData(format!("failed to load kubeconfig context {context}: {e}"))
            })?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::MissingData(format!("failed to infer kube config: {e}")))?,
    };
    debug!(msg = "kube config loaded", cluster_url = %config.cluster_url);
    Client::try_from(config).map_err(|e| Error::kube("failed to create kube client", e))
}

async fn read_stream<R>(reader: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => tokio_util::io::ReaderStream::new(reader)
            .filter_map(|r| async { r.ok().and_then(|v| String::from_utf8(v.to_vec()).ok()) })
            .collect::<Vec<_>>()
            .await
            .join(""),
        None => String::new(),
    }
}

/// Collect stdout and stderr of an attached process, stderr appended after stdout.
pub async fn get_combined_output(mut attached: AttachedProcess) -> Result<String> {
    let stdout = attached.stdout();
    let stderr = attached.stderr();
    let (out, err) = tokio::join!(read_stream(stdout), read_stream(stderr));
    attached
        .join()
        .await
        .map_err(|e| Error::KubeExecError(format!("failed to join attached process: {e}")))?;
    Ok(match (out.is_empty(), err.is_empty()) {
        (_, true) => out,
        (true, false) => err,
        (false, false) => format!("{out}\n{err}"),
    })
}
