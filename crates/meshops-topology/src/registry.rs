//! Topology registry client

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use meshops_common::Error;

/// Timeout for a single registry request
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the mesh listing on the registry service
pub const MESHES_PATH: &str = "/api/v1/meshes";

/// Role of a cluster inside its mesh
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    /// Runs the mesh control plane
    Primary,
    /// Joins the mesh through a primary
    #[default]
    Member,
}

/// A cluster and its role in a mesh
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MeshCluster {
    /// Cluster name
    pub name: String,
    /// Role in the mesh
    #[serde(default)]
    pub role: ClusterRole,
}

impl MeshCluster {
    /// A primary cluster
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: ClusterRole::Primary,
        }
    }

    /// A member cluster
    pub fn member(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: ClusterRole::Member,
        }
    }
}

/// One mesh and its clusters as reported by the registry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MeshTopology {
    /// Mesh name
    pub name: String,
    /// Clusters in the mesh
    #[serde(default)]
    pub clusters: Vec<MeshCluster>,
}

/// Source of the complete mesh topology
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopologyRegistry: Send + Sync {
    /// Fetch every mesh with its clusters in a single call
    async fn list_meshes(&self) -> Result<Vec<MeshTopology>, Error>;
}

/// Registry reached over HTTP, returning a JSON array of [`MeshTopology`]
#[derive(Debug, Clone)]
pub struct HttpTopologyRegistry {
    client: reqwest::Client,
    url: String,
}

impl HttpTopologyRegistry {
    /// Create a registry client for the service at `base_url`
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .map_err(|e| Error::topology(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a registry client using an existing HTTP client
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), MESHES_PATH),
        }
    }

    /// Full URL of the mesh listing
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TopologyRegistry for HttpTopologyRegistry {
    async fn list_meshes(&self) -> Result<Vec<MeshTopology>, Error> {
        debug!(url = %self.url, "fetching mesh topology");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::topology(format!("request to {} failed: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(Error::topology(format!(
                "registry returned {} for {}",
                response.status(),
                self.url
            )));
        }

        response
            .json::<Vec<MeshTopology>>()
            .await
            .map_err(|e| Error::topology(format!("invalid topology payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roles_are_lowercase() {
        let json = r#"[
            {"name": "meshA", "clusters": [
                {"name": "east", "role": "primary"},
                {"name": "west"}
            ]}
        ]"#;
        let meshes: Vec<MeshTopology> = serde_json::from_str(json).unwrap();
        assert_eq!(meshes.len(), 1);
        assert_eq!(meshes[0].clusters[0], MeshCluster::primary("east"));
        assert_eq!(meshes[0].clusters[1], MeshCluster::member("west"));
    }

    #[test]
    fn url_joins_without_double_slash() {
        let registry = HttpTopologyRegistry::with_client(reqwest::Client::new(), "http://registry:8080/");
        assert_eq!(registry.url(), "http://registry:8080/api/v1/meshes");
    }
}
