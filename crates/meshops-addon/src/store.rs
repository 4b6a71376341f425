//! Read cache and status writer for MeshAddon objects
//!
//! The controller only sees these two traits. Production uses a kube-rs
//! reflector store kept current by [`crate::watch::WatchDriver`] and the
//! status subresource; tests use in-memory doubles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use meshops_common::crd::MeshAddon;
use meshops_common::error::is_api_code;
use meshops_common::{split_key, Error};

use crate::watch::WatchSource;

/// Synchronized local view of MeshAddon objects
#[cfg_attr(test, automock)]
pub trait ResourceCache: Send + Sync {
    /// Object for `key`, if present
    fn get(&self, key: &str) -> Option<Arc<MeshAddon>>;

    /// Every cached object
    fn list(&self) -> Vec<Arc<MeshAddon>>;

    /// True once the initial list from the API server has been applied
    fn has_synced(&self) -> bool;
}

/// Writes the status subresource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceWriter: Send + Sync {
    /// Replace the status of `addon`.
    ///
    /// Returns [`Error::NotFound`] when the object is gone and
    /// [`Error::Conflict`] when `addon` carries a stale resource version.
    async fn update_status(&self, addon: &MeshAddon) -> Result<MeshAddon, Error>;
}

/// [`ResourceCache`] backed by a reflector store
#[derive(Clone)]
pub struct KubeResourceCache {
    store: Store<MeshAddon>,
    synced: Arc<AtomicBool>,
}

impl KubeResourceCache {
    /// Create an empty cache and the watch source that fills it
    pub fn new() -> (Self, WatchSource) {
        let (store, writer) = reflector::store();
        let synced = Arc::new(AtomicBool::new(false));
        let cache = Self {
            store: store.clone(),
            synced: synced.clone(),
        };
        (cache, WatchSource::new(store, writer, synced))
    }
}

/// Reference for a queue key
pub(crate) fn object_ref(key: &str) -> ObjectRef<MeshAddon> {
    let (namespace, name) = split_key(key);
    let reference = ObjectRef::new(name);
    match namespace {
        Some(ns) => reference.within(ns),
        None => reference,
    }
}

impl ResourceCache for KubeResourceCache {
    fn get(&self, key: &str) -> Option<Arc<MeshAddon>> {
        self.store.get(&object_ref(key))
    }

    fn list(&self) -> Vec<Arc<MeshAddon>> {
        self.store.state()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

/// [`ResourceWriter`] using `replace_status`
#[derive(Clone)]
pub struct KubeResourceWriter {
    client: Client,
}

impl KubeResourceWriter {
    /// Create a writer for the managing cluster
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceWriter for KubeResourceWriter {
    async fn update_status(&self, addon: &MeshAddon) -> Result<MeshAddon, Error> {
        let name = addon.name_any();
        let api: Api<MeshAddon> = Api::all(self.client.clone());
        let body = serde_json::to_vec(addon)?;

        match api.replace_status(&name, &PostParams::default(), body).await {
            Ok(updated) => {
                debug!(addon = %name, "status updated");
                Ok(updated)
            }
            Err(e) if is_api_code(&e, 404) => Err(Error::not_found("MeshAddon", name)),
            Err(e) if is_api_code(&e, 409) => Err(Error::conflict(name, e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ClusterResourceScope;
    use kube::Resource;

    fn assert_cluster_scoped<K: Resource<Scope = ClusterResourceScope>>() {}

    #[test]
    fn mesh_addon_status_is_written_cluster_wide() {
        // `Api::all` is the only constructor valid for the writer's object
        assert_cluster_scoped::<MeshAddon>();
    }

    #[test]
    fn object_ref_for_cluster_scoped_key() {
        let reference = object_ref("mm-1");
        assert_eq!(reference.name, "mm-1");
        assert_eq!(reference.namespace, None);

        let reference = object_ref("team-a/mm-1");
        assert_eq!(reference.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn fresh_cache_is_not_synced() {
        let (cache, _source) = KubeResourceCache::new();
        assert!(!cache.has_synced());
        assert!(cache.list().is_empty());
        assert!(cache.get("mm-1").is_none());
    }
}
