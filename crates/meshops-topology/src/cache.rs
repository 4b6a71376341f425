//! Read-through topology cache

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use meshops_common::Error;

use crate::registry::{ClusterRole, MeshTopology, TopologyRegistry};

/// Derived mesh/cluster indices built from one registry snapshot
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopologyIndex {
    mesh_clusters: HashMap<String, Vec<String>>,
    mesh_primaries: HashMap<String, Vec<String>>,
    cluster_mesh: HashMap<String, String>,
    member_primaries: HashMap<String, Vec<String>>,
}

impl TopologyIndex {
    /// Build all four indices from a complete mesh listing
    pub fn build(meshes: &[MeshTopology]) -> Self {
        let mut index = Self::default();

        for mesh in meshes {
            let clusters: Vec<String> = mesh.clusters.iter().map(|c| c.name.clone()).collect();
            let primaries: Vec<String> = mesh
                .clusters
                .iter()
                .filter(|c| c.role == ClusterRole::Primary)
                .map(|c| c.name.clone())
                .collect();

            for cluster in &clusters {
                if let Some(previous) = index.cluster_mesh.insert(cluster.clone(), mesh.name.clone()) {
                    warn!(
                        cluster = %cluster,
                        mesh = %mesh.name,
                        previous_mesh = %previous,
                        "cluster listed in more than one mesh, keeping the last"
                    );
                    index.member_primaries.remove(cluster);
                }
                if !primaries.is_empty() {
                    index.member_primaries.insert(cluster.clone(), primaries.clone());
                }
            }

            if !primaries.is_empty() {
                index.mesh_primaries.insert(mesh.name.clone(), primaries);
            }
            if !clusters.is_empty() {
                index.mesh_clusters.insert(mesh.name.clone(), clusters);
            }
        }

        index
    }

    /// Clusters in `mesh`
    pub fn clusters_of(&self, mesh: &str) -> Option<&[String]> {
        self.mesh_clusters.get(mesh).map(Vec::as_slice)
    }

    /// Primary clusters of `mesh`
    pub fn primary_clusters_of(&self, mesh: &str) -> Option<&[String]> {
        self.mesh_primaries.get(mesh).map(Vec::as_slice)
    }

    /// Mesh that `cluster` belongs to
    pub fn mesh_of(&self, cluster: &str) -> Option<&str> {
        self.cluster_mesh.get(cluster).map(String::as_str)
    }

    /// Primary clusters of the mesh `cluster` belongs to
    pub fn primary_clusters_for_member_cluster(&self, cluster: &str) -> Option<&[String]> {
        self.member_primaries.get(cluster).map(Vec::as_slice)
    }

    /// Number of meshes indexed
    pub fn mesh_count(&self) -> usize {
        self.mesh_clusters.len()
    }
}

/// Topology indices refreshed from the registry on a miss.
///
/// Every accessor reads under the shared lock first. Only an empty result
/// triggers a single [`TopologyCache::reload`] followed by one more read.
pub struct TopologyCache {
    registry: Arc<dyn TopologyRegistry>,
    index: RwLock<TopologyIndex>,
}

impl TopologyCache {
    /// Create an empty cache; the first lookup populates it
    pub fn new(registry: Arc<dyn TopologyRegistry>) -> Self {
        Self::with_index(registry, TopologyIndex::default())
    }

    /// Create a cache seeded with an existing index
    pub fn with_index(registry: Arc<dyn TopologyRegistry>, index: TopologyIndex) -> Self {
        Self {
            registry,
            index: RwLock::new(index),
        }
    }

    /// Clusters in `mesh`
    pub async fn clusters_of(&self, mesh: &str) -> Vec<String> {
        self.read_through(|idx| idx.clusters_of(mesh).map(<[String]>::to_vec))
            .await
            .unwrap_or_default()
    }

    /// Primary clusters of `mesh`
    pub async fn primary_clusters_of(&self, mesh: &str) -> Vec<String> {
        self.read_through(|idx| idx.primary_clusters_of(mesh).map(<[String]>::to_vec))
            .await
            .unwrap_or_default()
    }

    /// Mesh that `cluster` belongs to
    pub async fn mesh_of(&self, cluster: &str) -> Option<String> {
        self.read_through(|idx| idx.mesh_of(cluster).map(str::to_string))
            .await
    }

    /// Primary clusters of the mesh `cluster` belongs to
    pub async fn primary_clusters_for_member_cluster(&self, cluster: &str) -> Vec<String> {
        self.read_through(|idx| {
            idx.primary_clusters_for_member_cluster(cluster)
                .map(<[String]>::to_vec)
        })
        .await
        .unwrap_or_default()
    }

    /// Fetch the full topology and swap in freshly built indices
    pub async fn reload(&self) -> Result<(), Error> {
        let meshes = self.registry.list_meshes().await?;
        let fresh = TopologyIndex::build(&meshes);
        let mesh_count = fresh.mesh_count();

        *self.index.write() = fresh;

        info!(meshes = mesh_count, "reloaded mesh topology");
        Ok(())
    }

    /// Copy of the current indices
    pub fn snapshot(&self) -> TopologyIndex {
        self.index.read().clone()
    }

    async fn read_through<T, F>(&self, read: F) -> Option<T>
    where
        F: Fn(&TopologyIndex) -> Option<T>,
    {
        let hit = read(&self.index.read());
        if hit.is_some() {
            return hit;
        }

        debug!("topology cache miss, reloading");
        if let Err(e) = self.reload().await {
            warn!(error = %e, "topology reload failed, keeping previous index");
        }

        read(&self.index.read())
    }
}

static SHARED: OnceLock<Arc<TopologyCache>> = OnceLock::new();

/// Process-wide topology cache.
///
/// The first caller's `init` builds the instance; every later caller gets the
/// same one and its `init` is never run.
pub fn shared<F>(init: F) -> Arc<TopologyCache>
where
    F: FnOnce() -> TopologyCache,
{
    SHARED.get_or_init(|| Arc::new(init())).clone()
}
