//! Per-cluster client caches for meshops
//!
//! A [`ClusterClientCache`] maps a cluster name to a live client handle.
//! Entries never expire on a timer: each lookup probes the cached handle and
//! only a failed probe evicts it, after which the next lookup recreates it
//! from connection parameters supplied by a [`ClusterConnectionResolver`].
//!
//! Two caches share the algorithm and differ in the handle they build:
//! [`KubeClientCache`] for general-purpose access and [`MeshClientCache`] for
//! mesh resources.

pub mod cache;
pub mod mesh;
pub mod resolver;

pub use cache::{ClientFactory, ClusterClientCache, KubeClientCache, KubeClientFactory};
pub use mesh::{MeshClient, MeshClientCache, MeshClientFactory, MeshKind};
pub use resolver::{
    ClusterConnection, ClusterConnectionResolver, ConnectionResolver, ControlPlaneResolver,
    StaticFileResolver,
};
