//! Generic per-cluster client cache

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::Client;
use tracing::{debug, info, warn};

use meshops_common::kube_utils::client_from_kubeconfig;
use meshops_common::Error;

use crate::resolver::{ClusterConnection, ClusterConnectionResolver};

/// Namespace present on every Kubernetes cluster, used as the liveness probe target
pub const PROBE_NAMESPACE: &str = "kube-system";

/// Builds and validates client handles for one object schema
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Handle stored in the cache (cheap to clone)
    type Handle: Clone + Send + Sync + 'static;

    /// Short schema name for logs
    fn schema(&self) -> &'static str;

    /// Build a new handle from resolved connection parameters
    async fn connect(
        &self,
        cluster: &str,
        connection: ClusterConnection,
    ) -> Result<Self::Handle, Error>;

    /// Cheap liveness check against a well-known object
    async fn probe(&self, handle: &Self::Handle) -> Result<(), Error>;
}

/// Cluster name → client handle, validated on every lookup.
///
/// Entries are independent: a probe or recreation for one cluster never
/// blocks lookups for another, and no map guard is held across a network call.
pub struct ClusterClientCache<F: ClientFactory> {
    resolver: Arc<dyn ClusterConnectionResolver>,
    factory: F,
    entries: DashMap<String, F::Handle>,
}

impl<F: ClientFactory> ClusterClientCache<F> {
    /// Create an empty cache
    pub fn new(resolver: Arc<dyn ClusterConnectionResolver>, factory: F) -> Self {
        Self {
            resolver,
            factory,
            entries: DashMap::new(),
        }
    }

    /// Return a live handle for `cluster`, recreating it if the cached one fails its probe
    pub async fn get(&self, cluster: &str) -> Result<F::Handle, Error> {
        let cached = self.entries.get(cluster).map(|entry| entry.value().clone());

        if let Some(handle) = cached {
            match self.factory.probe(&handle).await {
                Ok(()) => return Ok(handle),
                Err(e) => {
                    warn!(
                        cluster = %cluster,
                        schema = self.factory.schema(),
                        error = %e,
                        "cached client failed liveness probe, recreating"
                    );
                    self.entries.remove(cluster);
                }
            }
        }

        let connection = self.resolver.resolve_connection(cluster).await?;
        let endpoint = connection.endpoint.clone();
        let handle = self.factory.connect(cluster, connection).await?;
        self.entries.insert(cluster.to_string(), handle.clone());

        info!(
            cluster = %cluster,
            schema = self.factory.schema(),
            endpoint = %endpoint,
            "created cluster client"
        );
        Ok(handle)
    }

    /// Drop the cached handle for `cluster`, if any
    pub fn invalidate(&self, cluster: &str) {
        if self.entries.remove(cluster).is_some() {
            debug!(cluster = %cluster, schema = self.factory.schema(), "invalidated client");
        }
    }

    /// Whether a handle is cached for `cluster`
    pub fn contains(&self, cluster: &str) -> bool {
        self.entries.contains_key(cluster)
    }

    /// Number of cached handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds general-purpose kube clients
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeClientFactory;

#[async_trait]
impl ClientFactory for KubeClientFactory {
    type Handle = Client;

    fn schema(&self) -> &'static str {
        "kube"
    }

    async fn connect(&self, _cluster: &str, connection: ClusterConnection) -> Result<Client, Error> {
        client_from_kubeconfig(connection.credentials, Some(&connection.endpoint)).await
    }

    async fn probe(&self, handle: &Client) -> Result<(), Error> {
        probe_client(handle).await
    }
}

/// Fetch the always-present `kube-system` namespace
pub(crate) async fn probe_client(client: &Client) -> Result<(), Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    api.get(PROBE_NAMESPACE).await?;
    Ok(())
}

/// Cache of general-purpose kube clients
pub type KubeClientCache = ClusterClientCache<KubeClientFactory>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MockClusterConnectionResolver;
    use kube::config::Kubeconfig;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Factory whose handles are generation numbers
    #[derive(Default)]
    struct CountingFactory {
        connects: AtomicU32,
        probes: AtomicU32,
        healthy: AtomicBool,
    }

    impl CountingFactory {
        fn healthy() -> Self {
            let f = Self::default();
            f.healthy.store(true, Ordering::SeqCst);
            f
        }
    }

    #[async_trait]
    impl ClientFactory for Arc<CountingFactory> {
        type Handle = u32;

        fn schema(&self) -> &'static str {
            "test"
        }

        async fn connect(&self, _cluster: &str, _conn: ClusterConnection) -> Result<u32, Error> {
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn probe(&self, _handle: &u32) -> Result<(), Error> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::connection("east", "connection refused"))
            }
        }
    }

    fn connection() -> ClusterConnection {
        ClusterConnection {
            endpoint: "https://east.example:6443".to_string(),
            credentials: Kubeconfig::default(),
        }
    }

    fn resolver_expecting(times: usize) -> Arc<dyn ClusterConnectionResolver> {
        let mut resolver = MockClusterConnectionResolver::new();
        resolver
            .expect_resolve_connection()
            .times(times)
            .returning(|_| Ok(connection()));
        Arc::new(resolver)
    }

    #[tokio::test]
    async fn first_lookup_creates_and_second_reuses() {
        let factory = Arc::new(CountingFactory::healthy());
        let cache = ClusterClientCache::new(resolver_expecting(1), factory.clone());

        assert_eq!(cache.get("east").await.unwrap(), 1);
        assert_eq!(cache.get("east").await.unwrap(), 1);

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        // Only the cached lookup is probed
        assert_eq!(factory.probes.load(Ordering::SeqCst), 1);
        assert!(cache.contains("east"));
    }

    #[tokio::test]
    async fn failed_probe_recreates_exactly_once() {
        let factory = Arc::new(CountingFactory::healthy());
        let cache = ClusterClientCache::new(resolver_expecting(2), factory.clone());

        assert_eq!(cache.get("east").await.unwrap(), 1);

        factory.healthy.store(false, Ordering::SeqCst);
        let handle = cache.get("east").await.unwrap();

        assert_eq!(handle, 2, "stale handle must not be reused");
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn clusters_are_cached_independently() {
        let factory = Arc::new(CountingFactory::healthy());
        let cache = ClusterClientCache::new(resolver_expecting(2), factory.clone());

        cache.get("east").await.unwrap();
        cache.get("west").await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.invalidate("east");
        assert!(!cache.contains("east"));
        assert!(cache.contains("west"));
    }

    #[tokio::test]
    async fn resolver_failure_caches_nothing() {
        let mut resolver = MockClusterConnectionResolver::new();
        resolver
            .expect_resolve_connection()
            .times(1)
            .returning(|cluster| Err(Error::connection(cluster, "no kubeconfig")));
        let factory = Arc::new(CountingFactory::healthy());
        let cache = ClusterClientCache::new(Arc::new(resolver), factory.clone());

        let err = cache.get("east").await.unwrap_err();
        assert_eq!(err.cluster(), Some("east"));
        assert!(cache.is_empty());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
    }
}
