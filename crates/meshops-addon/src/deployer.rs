//! Installs the mesh manager on a target cluster
//!
//! An install is four server-side applies (ServiceAccount, ClusterRoleBinding,
//! Service, Deployment) after the target namespace is ensured. Teardown
//! deletes the Deployment, ClusterRoleBinding and ServiceAccount.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use meshops_clients::KubeClientCache;
use meshops_common::crd::MeshAddon;
use meshops_common::error::is_api_code;
use meshops_common::kube_utils::{available_replicas, delete_if_exists, ensure_namespace, managed_labels};
use meshops_common::{Error, FIELD_MANAGER};
use meshops_topology::TopologyCache;

/// Container name of the mesh manager
pub const MANAGER_CONTAINER: &str = "mesh-manager";

/// Port the mesh manager serves on
pub const MANAGER_PORT: i32 = 8080;

/// Default image repository; the tag is the addon version
pub const DEFAULT_IMAGE_REPOSITORY: &str = "ghcr.io/meshops/mesh-manager";

/// Where an addon's resources live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddonTarget {
    /// Addon name; also the name of its namespaced resources
    pub name: String,
    /// Target cluster
    pub cluster: String,
    /// Namespace on the target cluster
    pub namespace: String,
}

impl AddonTarget {
    /// Target of an addon object
    pub fn of(addon: &MeshAddon) -> Self {
        Self {
            name: addon.name_any(),
            cluster: addon.spec.cluster.clone(),
            namespace: addon.spec.target_namespace().to_string(),
        }
    }

    /// Name of the cluster-scoped role binding
    pub fn binding_name(&self) -> String {
        format!("meshops:{}:{}", self.namespace, self.name)
    }
}

/// Operations on the target cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AddonDeployer: Send + Sync {
    /// Create or update every resource of the addon
    async fn install(&self, addon: &MeshAddon) -> Result<(), Error>;

    /// Remove the addon's resources; resources already absent are not an error
    async fn uninstall(&self, target: &AddonTarget) -> Result<(), Error>;

    /// True when the manager deployment has at least one available replica
    async fn is_healthy(&self, target: &AddonTarget) -> Result<bool, Error>;

    /// Roll the manager deployment to `version`
    async fn upgrade(&self, target: &AddonTarget, version: &str) -> Result<(), Error>;
}

/// [`AddonDeployer`] talking to target clusters through the client cache
pub struct KubeAddonDeployer {
    clients: Arc<KubeClientCache>,
    topology: Option<Arc<TopologyCache>>,
    image_repository: String,
}

impl KubeAddonDeployer {
    /// Create a deployer
    pub fn new(clients: Arc<KubeClientCache>, image_repository: impl Into<String>) -> Self {
        Self {
            clients,
            topology: None,
            image_repository: image_repository.into(),
        }
    }

    /// Pass mesh membership to installed managers
    pub fn with_topology(mut self, topology: Arc<TopologyCache>) -> Self {
        self.topology = Some(topology);
        self
    }

    async fn client(&self, cluster: &str) -> Result<Client, Error> {
        self.clients.get(cluster).await
    }

    async fn mesh_env(&self, cluster: &str) -> Vec<EnvVar> {
        let Some(topology) = &self.topology else {
            return Vec::new();
        };
        let mut env = Vec::new();
        if let Some(mesh) = topology.mesh_of(cluster).await {
            env.push(env_var("MESH_NAME", &mesh));
        }
        let primaries = topology.primary_clusters_for_member_cluster(cluster).await;
        if !primaries.is_empty() {
            env.push(env_var("MESH_PRIMARY_CLUSTERS", &primaries.join(",")));
        }
        env
    }
}

#[async_trait]
impl AddonDeployer for KubeAddonDeployer {
    async fn install(&self, addon: &MeshAddon) -> Result<(), Error> {
        let target = AddonTarget::of(addon);
        let client = self.client(&target.cluster).await?;
        let mesh_env = self.mesh_env(&target.cluster).await;
        let manifests = Manifests::build(addon, &self.image_repository, mesh_env);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let install_err = |e: kube::Error| Error::install(&target.name, &target.cluster, e.to_string());

        ensure_namespace(&client, &target.namespace).await?;

        let sa_api: Api<ServiceAccount> = Api::namespaced(client.clone(), &target.namespace);
        sa_api
            .patch(&target.name, &params, &Patch::Apply(&manifests.service_account))
            .await
            .map_err(install_err)?;

        let crb_api: Api<ClusterRoleBinding> = Api::all(client.clone());
        crb_api
            .patch(&target.binding_name(), &params, &Patch::Apply(&manifests.role_binding))
            .await
            .map_err(install_err)?;

        let svc_api: Api<Service> = Api::namespaced(client.clone(), &target.namespace);
        svc_api
            .patch(&target.name, &params, &Patch::Apply(&manifests.service))
            .await
            .map_err(install_err)?;

        let deploy_api: Api<Deployment> = Api::namespaced(client, &target.namespace);
        deploy_api
            .patch(&target.name, &params, &Patch::Apply(&manifests.deployment))
            .await
            .map_err(install_err)?;

        info!(
            addon = %target.name,
            cluster = %target.cluster,
            version = %addon.spec.version,
            "installed mesh manager"
        );
        Ok(())
    }

    async fn uninstall(&self, target: &AddonTarget) -> Result<(), Error> {
        let client = self.client(&target.cluster).await?;

        let deploy_api: Api<Deployment> = Api::namespaced(client.clone(), &target.namespace);
        let crb_api: Api<ClusterRoleBinding> = Api::all(client.clone());
        let sa_api: Api<ServiceAccount> = Api::namespaced(client, &target.namespace);

        // Every delete is attempted even when an earlier one failed
        let results = vec![
            ("deployment", delete_if_exists(&deploy_api, &target.name).await),
            ("clusterrolebinding", delete_if_exists(&crb_api, &target.binding_name()).await),
            ("serviceaccount", delete_if_exists(&sa_api, &target.name).await),
        ];
        teardown_result(target, results)?;

        debug!(addon = %target.name, cluster = %target.cluster, "uninstalled mesh manager");
        Ok(())
    }

    async fn is_healthy(&self, target: &AddonTarget) -> Result<bool, Error> {
        let client = self.client(&target.cluster).await?;
        let api: Api<Deployment> = Api::namespaced(client, &target.namespace);
        match api.get(&target.name).await {
            Ok(deployment) => Ok(available_replicas(&deployment) >= 1),
            Err(e) if is_api_code(&e, 404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upgrade(&self, target: &AddonTarget, version: &str) -> Result<(), Error> {
        let client = self.client(&target.cluster).await?;
        let api: Api<Deployment> = Api::namespaced(client, &target.namespace);
        let patch = image_patch(&self.image_repository, version);
        api.patch(&target.name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| Error::install(&target.name, &target.cluster, e.to_string()))?;
        info!(addon = %target.name, cluster = %target.cluster, version = %version, "upgraded mesh manager");
        Ok(())
    }
}

/// Fold the per-resource delete outcomes into one error naming every failure
fn teardown_result(
    target: &AddonTarget,
    results: Vec<(&str, Result<bool, Error>)>,
) -> Result<(), Error> {
    let failures: Vec<String> = results
        .into_iter()
        .filter_map(|(kind, result)| result.err().map(|e| format!("{}: {}", kind, e)))
        .collect();
    if failures.is_empty() {
        return Ok(());
    }
    Err(Error::install(&target.name, &target.cluster, failures.join("; ")))
}

// =============================================================================
// Manifests
// =============================================================================

/// Image reference for a version
pub fn image(repository: &str, version: &str) -> String {
    format!("{}:{}", repository, version)
}

/// Strategic-merge patch that only changes the manager image
pub fn image_patch(repository: &str, version: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{
                        "name": MANAGER_CONTAINER,
                        "image": image(repository, version),
                    }]
                }
            }
        }
    })
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), MANAGER_CONTAINER.to_string()),
        ("app.kubernetes.io/instance".to_string(), name.to_string()),
    ])
}

/// Every resource of one addon install
pub struct Manifests {
    /// Manager identity
    pub service_account: ServiceAccount,
    /// Grants the manager cluster-admin
    pub role_binding: ClusterRoleBinding,
    /// Exposes the manager API
    pub service: Service,
    /// Runs the manager
    pub deployment: Deployment,
}

impl Manifests {
    /// Render the manifests for `addon`
    pub fn build(addon: &MeshAddon, image_repository: &str, mesh_env: Vec<EnvVar>) -> Self {
        let target = AddonTarget::of(addon);
        let selector = selector_labels(&target.name);
        let labels = managed_labels(selector.clone());
        let meta = || ObjectMeta {
            name: Some(target.name.clone()),
            namespace: Some(target.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        };

        let mut env = vec![env_var("CLUSTER_NAME", &target.cluster)];
        if let Some(endpoint) = &addon.spec.backend.endpoint {
            env.push(env_var("MESH_BACKEND_ENDPOINT", endpoint));
        }
        env.extend(mesh_env);
        env.extend(addon.spec.backend.env.iter().map(|(k, v)| env_var(k, v)));

        let service_account = ServiceAccount {
            metadata: meta(),
            ..Default::default()
        };

        let role_binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(target.binding_name()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "cluster-admin".to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: target.name.clone(),
                namespace: Some(target.namespace.clone()),
                ..Default::default()
            }]),
        };

        let service = Service {
            metadata: meta(),
            spec: Some(ServiceSpec {
                selector: Some(selector.clone()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: MANAGER_PORT,
                    target_port: Some(IntOrString::Int(MANAGER_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let deployment = Deployment {
            metadata: meta(),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(target.name.clone()),
                        containers: vec![Container {
                            name: MANAGER_CONTAINER.to_string(),
                            image: Some(image(image_repository, &addon.spec.version)),
                            env: Some(env),
                            ports: Some(vec![ContainerPort {
                                name: Some("http".to_string()),
                                container_port: MANAGER_PORT,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        Self {
            service_account,
            role_binding,
            service,
            deployment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshops_common::crd::{BackendConfig, MeshAddonSpec};
    use meshops_common::{DEFAULT_ADDON_NAMESPACE, MANAGED_BY_LABEL};

    fn addon() -> MeshAddon {
        MeshAddon::new(
            "mm-1",
            MeshAddonSpec {
                cluster: "east".to_string(),
                version: "1.2.0".to_string(),
                namespace: None,
                backend: BackendConfig {
                    endpoint: Some("https://backend.example".to_string()),
                    env: BTreeMap::from([("LOG_LEVEL".to_string(), "debug".to_string())]),
                },
            },
        )
    }

    fn target() -> AddonTarget {
        AddonTarget::of(&addon())
    }

    #[test]
    fn teardown_with_absent_resources_succeeds() {
        let results = vec![
            ("deployment", Ok(true)),
            ("clusterrolebinding", Ok(false)),
            ("serviceaccount", Ok(false)),
        ];
        assert!(teardown_result(&target(), results).is_ok());
    }

    #[test]
    fn teardown_error_lists_every_failed_delete() {
        let results = vec![
            ("deployment", Err(Error::connection("east", "connection reset"))),
            ("clusterrolebinding", Ok(true)),
            ("serviceaccount", Err(Error::internal("forbidden"))),
        ];

        let err = teardown_result(&target(), results).unwrap_err();

        assert_eq!(err.cluster(), Some("east"));
        let message = err.to_string();
        assert!(message.contains("deployment: connection error for cluster east: connection reset"));
        assert!(message.contains("serviceaccount: "));
        assert!(message.contains("forbidden"));
        assert!(!message.contains("clusterrolebinding"));
    }

    fn container(m: &Manifests) -> &Container {
        &m.deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .unwrap()
            .containers[0]
    }

    fn env_value<'a>(c: &'a Container, name: &str) -> Option<&'a str> {
        c.env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    #[test]
    fn target_defaults_namespace() {
        let target = AddonTarget::of(&addon());
        assert_eq!(target.namespace, DEFAULT_ADDON_NAMESPACE);
        assert_eq!(target.binding_name(), "meshops:mesh-system:mm-1");
    }

    #[test]
    fn deployment_runs_versioned_image_with_backend_env() {
        let m = Manifests::build(&addon(), DEFAULT_IMAGE_REPOSITORY, vec![env_var("MESH_NAME", "meshA")]);
        let c = container(&m);

        assert_eq!(c.name, MANAGER_CONTAINER);
        assert_eq!(c.image.as_deref(), Some("ghcr.io/meshops/mesh-manager:1.2.0"));
        assert_eq!(env_value(c, "CLUSTER_NAME"), Some("east"));
        assert_eq!(env_value(c, "MESH_BACKEND_ENDPOINT"), Some("https://backend.example"));
        assert_eq!(env_value(c, "MESH_NAME"), Some("meshA"));
        assert_eq!(env_value(c, "LOG_LEVEL"), Some("debug"));
    }

    #[test]
    fn binding_targets_manager_service_account() {
        let m = Manifests::build(&addon(), DEFAULT_IMAGE_REPOSITORY, Vec::new());
        let subject = &m.role_binding.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.name, "mm-1");
        assert_eq!(subject.namespace.as_deref(), Some(DEFAULT_ADDON_NAMESPACE));
        assert_eq!(m.role_binding.role_ref.name, "cluster-admin");
        assert!(m.service_account.labels().contains_key(MANAGED_BY_LABEL));
    }

    #[test]
    fn service_selects_deployment_pods() {
        let m = Manifests::build(&addon(), DEFAULT_IMAGE_REPOSITORY, Vec::new());
        let svc_selector = m.service.spec.as_ref().and_then(|s| s.selector.clone()).unwrap();
        let pod_labels = m
            .deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|meta| meta.labels.clone())
            .unwrap();
        for (k, v) in &svc_selector {
            assert_eq!(pod_labels.get(k), Some(v));
        }
    }

    #[test]
    fn image_patch_names_container() {
        let patch = image_patch("repo/mm", "2.0");
        let containers = &patch["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers[0]["name"], MANAGER_CONTAINER);
        assert_eq!(containers[0]["image"], "repo/mm:2.0");
    }
}
