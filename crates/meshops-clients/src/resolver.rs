//! Cluster connection resolution
//!
//! Turns a cluster name into the endpoint and credentials needed to build a
//! client. Two backends exist and one is chosen at startup:
//!
//! - [`ControlPlaneResolver`]: reads `<cluster>-kubeconfig` Secrets from the
//!   managing cluster (the convention Cluster API uses for workload clusters)
//! - [`StaticFileResolver`]: reads kubeconfig files from a local directory,
//!   for development and tests

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::Kubeconfig;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use meshops_common::error::is_api_code;
use meshops_common::kube_utils::kubeconfig_server;
use meshops_common::Error;

/// Data keys checked, in order, on a kubeconfig Secret
const KUBECONFIG_SECRET_KEYS: &[&str] = &["value", "kubeconfig"];

/// File names tried, in order, by the static resolver
const KUBECONFIG_FILE_SUFFIXES: &[&str] = &[".yaml", ".kubeconfig", ""];

/// Connection parameters for one target cluster
#[derive(Clone, Debug)]
pub struct ClusterConnection {
    /// API server URL
    pub endpoint: String,
    /// Kubeconfig carrying the credentials
    pub credentials: Kubeconfig,
}

impl ClusterConnection {
    /// Build a connection from a kubeconfig, taking the endpoint from its server URL
    pub fn from_kubeconfig(cluster: &str, kubeconfig: Kubeconfig) -> Result<Self, Error> {
        let endpoint = kubeconfig_server(&kubeconfig)
            .ok_or_else(|| Error::connection(cluster, "kubeconfig has no server URL"))?;
        Ok(Self {
            endpoint,
            credentials: kubeconfig,
        })
    }
}

/// Resolves a cluster name to connection parameters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnectionResolver: Send + Sync {
    /// Look up the endpoint and credentials for `cluster`
    async fn resolve_connection(&self, cluster: &str) -> Result<ClusterConnection, Error>;
}

/// The resolver selected at startup
pub enum ConnectionResolver {
    /// Kubeconfig Secrets on the managing cluster
    ControlPlane(ControlPlaneResolver),
    /// Kubeconfig files on local disk
    StaticFile(StaticFileResolver),
}

#[async_trait]
impl ClusterConnectionResolver for ConnectionResolver {
    async fn resolve_connection(&self, cluster: &str) -> Result<ClusterConnection, Error> {
        match self {
            Self::ControlPlane(r) => r.resolve_connection(cluster).await,
            Self::StaticFile(r) => r.resolve_connection(cluster).await,
        }
    }
}

/// Resolves clusters through kubeconfig Secrets on the managing cluster
pub struct ControlPlaneResolver {
    client: Client,
    namespace: String,
}

impl ControlPlaneResolver {
    /// Create a resolver reading Secrets from `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

/// Name of the Secret holding a cluster's kubeconfig
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{cluster}-kubeconfig")
}

#[async_trait]
impl ClusterConnectionResolver for ControlPlaneResolver {
    async fn resolve_connection(&self, cluster: &str) -> Result<ClusterConnection, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = kubeconfig_secret_name(cluster);

        let secret = match api.get(&name).await {
            Ok(secret) => secret,
            Err(e) if is_api_code(&e, 404) => {
                return Err(Error::connection(
                    cluster,
                    format!("kubeconfig secret {}/{} not found", self.namespace, name),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let data = secret.data.unwrap_or_default();
        let raw = KUBECONFIG_SECRET_KEYS
            .iter()
            .find_map(|key| data.get(*key))
            .ok_or_else(|| {
                Error::connection(cluster, format!("secret {} has no kubeconfig data", name))
            })?;
        let yaml = std::str::from_utf8(&raw.0)
            .map_err(|e| Error::connection(cluster, format!("kubeconfig is not UTF-8: {}", e)))?;
        let kubeconfig = Kubeconfig::from_yaml(yaml)
            .map_err(|e| Error::connection(cluster, format!("invalid kubeconfig: {}", e)))?;

        debug!(cluster = %cluster, secret = %name, "resolved cluster from control plane");
        ClusterConnection::from_kubeconfig(cluster, kubeconfig)
    }
}

/// Resolves clusters through kubeconfig files in a directory
pub struct StaticFileResolver {
    dir: PathBuf,
}

impl StaticFileResolver {
    /// Create a resolver reading `<dir>/<cluster>.yaml` (or `.kubeconfig`, or no suffix)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn candidates(&self, cluster: &str) -> impl Iterator<Item = PathBuf> + '_ {
        let cluster = cluster.to_string();
        KUBECONFIG_FILE_SUFFIXES
            .iter()
            .map(move |suffix| self.dir.join(format!("{cluster}{suffix}")))
    }
}

async fn read_kubeconfig(cluster: &str, path: &Path) -> Result<Kubeconfig, Error> {
    let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::connection(cluster, format!("failed to read {}: {}", path.display(), e))
    })?;
    Kubeconfig::from_yaml(&yaml).map_err(|e| {
        Error::connection(cluster, format!("invalid kubeconfig {}: {}", path.display(), e))
    })
}

#[async_trait]
impl ClusterConnectionResolver for StaticFileResolver {
    async fn resolve_connection(&self, cluster: &str) -> Result<ClusterConnection, Error> {
        for path in self.candidates(cluster) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                let kubeconfig = read_kubeconfig(cluster, &path).await?;
                debug!(cluster = %cluster, path = %path.display(), "resolved cluster from file");
                return ClusterConnection::from_kubeconfig(cluster, kubeconfig);
            }
        }
        Err(Error::connection(
            cluster,
            format!("no kubeconfig for cluster in {}", self.dir.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kubeconfig_yaml(server: &str) -> String {
        format!(
            r#"
apiVersion: v1
kind: Config
current-context: default
clusters:
- name: default
  cluster:
    server: {server}
contexts:
- name: default
  context:
    cluster: default
    user: admin
users:
- name: admin
  user:
    token: secret-token
"#
        )
    }

    #[tokio::test]
    async fn static_resolver_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("east.yaml"),
            kubeconfig_yaml("https://east.example:6443"),
        )
        .unwrap();

        let resolver = StaticFileResolver::new(dir.path());
        let conn = resolver.resolve_connection("east").await.unwrap();
        assert_eq!(conn.endpoint, "https://east.example:6443");
    }

    #[tokio::test]
    async fn static_resolver_accepts_bare_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("west"), kubeconfig_yaml("https://west.example")).unwrap();

        let resolver = ConnectionResolver::StaticFile(StaticFileResolver::new(dir.path()));
        let conn = resolver.resolve_connection("west").await.unwrap();
        assert_eq!(conn.endpoint, "https://west.example");
    }

    #[tokio::test]
    async fn static_resolver_missing_cluster_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = StaticFileResolver::new(dir.path());
        let err = resolver.resolve_connection("nowhere").await.unwrap_err();
        assert_eq!(err.cluster(), Some("nowhere"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn static_resolver_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "not: [a kubeconfig").unwrap();
        let resolver = StaticFileResolver::new(dir.path());
        assert!(resolver.resolve_connection("bad").await.is_err());
    }

    #[test]
    fn secret_name_follows_capi_convention() {
        assert_eq!(kubeconfig_secret_name("east"), "east-kubeconfig");
    }
}
