//! Shared Kubernetes utilities using kube-rs

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::error::is_api_code;
use crate::{Error, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            client_from_kubeconfig(kubeconfig, None).await
        }
        None => {
            let mut config = Config::infer().await.map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to infer config: {}", e),
                )
            })?;
            config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
            config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
            Client::try_from(config).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to create client: {}", e),
                )
            })
        }
    }
}

/// Build a client from an in-memory kubeconfig.
///
/// When `endpoint` is set it replaces the server URL from the kubeconfig,
/// which lets a resolver route through a proxy without rewriting the file.
pub async fn client_from_kubeconfig(
    kubeconfig: Kubeconfig,
    endpoint: Option<&str>,
) -> Result<Client, Error> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig: {}", e),
            )
        })?;
    if let Some(endpoint) = endpoint {
        config.cluster_url = endpoint.parse().map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("invalid endpoint {}: {}", endpoint, e),
            )
        })?;
    }
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Server URL of the current (or first) cluster in a kubeconfig
pub fn kubeconfig_server(kubeconfig: &Kubeconfig) -> Option<String> {
    let cluster_name = kubeconfig
        .current_context
        .as_ref()
        .and_then(|ctx| kubeconfig.contexts.iter().find(|c| &c.name == ctx))
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone());

    let named = match cluster_name {
        Some(name) => kubeconfig.clusters.iter().find(|c| c.name == name),
        None => kubeconfig.clusters.first(),
    };
    named
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone())
}

/// Delete a resource, treating "already absent" as success.
///
/// Returns `Ok(true)` when something was deleted and `Ok(false)` when the
/// resource did not exist.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<bool, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!(name = %name, "deleted resource");
            Ok(true)
        }
        Err(e) if is_api_code(&e, 404) => {
            trace!(name = %name, "resource already absent");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Ensure a namespace exists via server-side apply
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<(), Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(managed_labels(BTreeMap::new())),
            ..Default::default()
        },
        ..Default::default()
    };
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
        .await?;
    debug!(namespace = %name, "ensured namespace");
    Ok(())
}

/// Add the meshops managed-by label to a label map
pub fn managed_labels(mut labels: BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Number of available replicas reported by a Deployment
pub fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: east
clusters:
- name: west
  cluster:
    server: https://west.example:6443
- name: east
  cluster:
    server: https://east.example:6443
contexts:
- name: east
  context:
    cluster: east
    user: admin
users:
- name: admin
  user:
    token: abc
"#;

    #[test]
    fn server_follows_current_context() {
        let kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        assert_eq!(
            kubeconfig_server(&kubeconfig).as_deref(),
            Some("https://east.example:6443")
        );
    }

    #[test]
    fn server_falls_back_to_first_cluster() {
        let mut kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        kubeconfig.current_context = None;
        assert_eq!(
            kubeconfig_server(&kubeconfig).as_deref(),
            Some("https://west.example:6443")
        );
    }

    #[test]
    fn available_replicas_defaults_to_zero() {
        let mut deployment = Deployment::default();
        assert_eq!(available_replicas(&deployment), 0);
        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(2),
            ..Default::default()
        });
        assert_eq!(available_replicas(&deployment), 2);
    }

    #[test]
    fn managed_labels_are_added() {
        let labels = managed_labels(BTreeMap::from([("app".to_string(), "x".to_string())]));
        assert_eq!(labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGED_BY_VALUE));
        assert_eq!(labels.len(), 2);
    }
}
