//! Mesh-resource clients
//!
//! Mesh resources (VirtualService, DestinationRule, ...) are not part of
//! k8s-openapi, so they are addressed as [`DynamicObject`]s through an
//! [`ApiResource`] built from the group/version/kind.

use std::fmt;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;

use meshops_common::kube_utils::client_from_kubeconfig;
use meshops_common::Error;

use crate::cache::{probe_client, ClientFactory, ClusterClientCache};
use crate::resolver::ClusterConnection;

/// API group of the mesh networking resources
pub const MESH_NETWORKING_GROUP: &str = "networking.istio.io";

/// API version used for mesh networking resources
pub const MESH_NETWORKING_VERSION: &str = "v1beta1";

/// Mesh networking resource kinds reachable through a [`MeshClient`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MeshKind {
    /// Traffic routing rules
    VirtualService,
    /// Per-destination traffic policy
    DestinationRule,
    /// Ingress/egress gateway listeners
    Gateway,
    /// External services registered in the mesh
    ServiceEntry,
}

impl MeshKind {
    /// All supported kinds
    pub const ALL: [MeshKind; 4] = [
        MeshKind::VirtualService,
        MeshKind::DestinationRule,
        MeshKind::Gateway,
        MeshKind::ServiceEntry,
    ];

    /// Kubernetes `kind`
    pub fn kind(&self) -> &'static str {
        match self {
            MeshKind::VirtualService => "VirtualService",
            MeshKind::DestinationRule => "DestinationRule",
            MeshKind::Gateway => "Gateway",
            MeshKind::ServiceEntry => "ServiceEntry",
        }
    }

    /// Plural resource name used in API paths
    pub fn plural(&self) -> &'static str {
        match self {
            MeshKind::VirtualService => "virtualservices",
            MeshKind::DestinationRule => "destinationrules",
            MeshKind::Gateway => "gateways",
            MeshKind::ServiceEntry => "serviceentries",
        }
    }

    /// `group/version` string
    pub fn api_version(&self) -> String {
        format!("{}/{}", MESH_NETWORKING_GROUP, MESH_NETWORKING_VERSION)
    }

    /// Dynamic API resource descriptor
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(MESH_NETWORKING_GROUP, MESH_NETWORKING_VERSION, self.kind());
        ApiResource::from_gvk_with_plural(&gvk, self.plural())
    }

    /// Parse a kind from its name or plural, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.kind().to_ascii_lowercase() == lower || k.plural() == lower)
    }
}

impl fmt::Display for MeshKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Client for mesh networking resources on one cluster
#[derive(Clone)]
pub struct MeshClient {
    client: Client,
}

impl MeshClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Underlying kube client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Dynamic API for `kind`, namespaced when `namespace` is given
    pub fn api(&self, kind: MeshKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    /// List objects of `kind`
    pub async fn list(
        &self,
        kind: MeshKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let list = self.api(kind, namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }
}

/// Builds [`MeshClient`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MeshClientFactory;

#[async_trait]
impl ClientFactory for MeshClientFactory {
    type Handle = MeshClient;

    fn schema(&self) -> &'static str {
        "mesh"
    }

    async fn connect(
        &self,
        _cluster: &str,
        connection: ClusterConnection,
    ) -> Result<MeshClient, Error> {
        let client = client_from_kubeconfig(connection.credentials, Some(&connection.endpoint)).await?;
        Ok(MeshClient::new(client))
    }

    async fn probe(&self, handle: &MeshClient) -> Result<(), Error> {
        probe_client(&handle.client).await
    }
}

/// Cache of mesh-resource clients
pub type MeshClientCache = ClusterClientCache<MeshClientFactory>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_uses_networking_group() {
        let ar = MeshKind::VirtualService.api_resource();
        assert_eq!(ar.group, "networking.istio.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.kind, "VirtualService");
        assert_eq!(ar.plural, "virtualservices");
        assert_eq!(ar.api_version, MeshKind::Gateway.api_version());
    }

    #[test]
    fn parse_accepts_kind_and_plural() {
        assert_eq!(MeshKind::parse("virtualservice"), Some(MeshKind::VirtualService));
        assert_eq!(MeshKind::parse("DestinationRule"), Some(MeshKind::DestinationRule));
        assert_eq!(MeshKind::parse("serviceentries"), Some(MeshKind::ServiceEntry));
        assert_eq!(MeshKind::parse("pods"), None);
    }

    #[test]
    fn display_is_kind() {
        assert_eq!(MeshKind::Gateway.to_string(), "Gateway");
    }
}
