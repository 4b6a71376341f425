//! Mesh ↔ cluster topology for meshops
//!
//! The topology registry is the source of truth for which clusters belong to
//! which mesh and which of them are primaries. [`TopologyCache`] keeps four
//! derived indices over one registry snapshot and refreshes them only when a
//! lookup comes back empty.

pub mod cache;
pub mod registry;

pub use cache::{shared, TopologyCache, TopologyIndex};
pub use registry::{ClusterRole, HttpTopologyRegistry, MeshCluster, MeshTopology, TopologyRegistry};
