//! Mesh inspection subcommands

use std::fmt;

use kube::ResourceExt;
use tracing::warn;

use meshops_clients::{MeshClientCache, MeshKind};
use meshops_topology::TopologyCache;

/// Membership of one mesh as seen through the topology cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyReport {
    pub mesh: String,
    pub clusters: Vec<String>,
    pub primaries: Vec<String>,
}

impl TopologyReport {
    /// Look up `mesh`; an unknown mesh yields empty lists
    pub async fn load(topology: &TopologyCache, mesh: &str) -> Self {
        Self {
            mesh: mesh.to_string(),
            clusters: topology.clusters_of(mesh).await,
            primaries: topology.primary_clusters_of(mesh).await,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl fmt::Display for TopologyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mesh: {}", self.mesh)?;
        writeln!(f, "clusters:")?;
        for cluster in &self.clusters {
            let role = if self.primaries.contains(cluster) {
                "primary"
            } else {
                "member"
            };
            writeln!(f, "  - {} ({})", cluster, role)?;
        }
        Ok(())
    }
}

/// Mesh resources found on one cluster
#[derive(Debug)]
pub struct ClusterResources {
    pub cluster: String,
    /// `namespace/name` of each object, or the error that prevented listing
    pub objects: Result<Vec<String>, String>,
}

/// List `kind` on every primary cluster of `mesh`.
///
/// A cluster that cannot be reached is reported and skipped; its cached
/// client is left to the cache's own liveness probe.
pub async fn mesh_resources(
    topology: &TopologyCache,
    clients: &MeshClientCache,
    mesh: &str,
    kind: MeshKind,
    namespace: Option<&str>,
) -> Vec<ClusterResources> {
    let mut results = Vec::new();
    for cluster in topology.primary_clusters_of(mesh).await {
        let objects = match clients.get(&cluster).await {
            Ok(client) => client.list(kind, namespace).await,
            Err(e) => Err(e),
        };
        let objects = objects
            .map(|items| {
                items
                    .iter()
                    .map(|o| format!("{}/{}", o.namespace().unwrap_or_default(), o.name_any()))
                    .collect()
            })
            .map_err(|e| {
                warn!(cluster = %cluster, kind = %kind, error = %e, "failed to list mesh resources");
                e.to_string()
            });
        results.push(ClusterResources { cluster, objects });
    }
    results
}

/// Render [`mesh_resources`] output
pub fn render_resources(kind: MeshKind, results: &[ClusterResources]) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!("{} on {}:\n", kind, result.cluster));
        match &result.objects {
            Ok(objects) if objects.is_empty() => out.push_str("  (none)\n"),
            Ok(objects) => {
                for object in objects {
                    out.push_str(&format!("  {}\n", object));
                }
            }
            Err(e) => out.push_str(&format!("  error: {}\n", e)),
        }
    }
    out
}
