//! MeshAddon CRD: a mesh-manager control plane installed on a target cluster
//!
//! `spec` names the target cluster and the desired manager version; the
//! status records where the addon is in its lifecycle. Status is written only
//! by the addon controller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, DEFAULT_ADDON_NAMESPACE};

/// Upper bound for `status.retryCount`
pub const MAX_RETRY_COUNT: u32 = 5;

/// Spec for a MeshAddon
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meshops.dev",
    version = "v1alpha1",
    kind = "MeshAddon",
    plural = "meshaddons",
    shortname = "ma",
    status = "MeshAddonStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MeshAddonSpec {
    /// Name of the target cluster the addon is installed on
    pub cluster: String,

    /// Desired mesh-manager version (image tag)
    pub version: String,

    /// Namespace on the target cluster (defaults to `mesh-system`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Backend the manager talks to
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Backend configuration handed to the mesh manager
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Address of the mesh backend API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Extra environment passed to the manager container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl MeshAddonSpec {
    /// Validate the spec of the addon named `addon`
    pub fn validate(&self, addon: &str) -> crate::Result<()> {
        if self.cluster.trim().is_empty() {
            return Err(Error::validation_for(addon, "spec.cluster cannot be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(Error::validation_for(addon, "spec.version cannot be empty"));
        }
        if let Some(ns) = &self.namespace {
            if ns.is_empty() {
                return Err(Error::validation_for(
                    addon,
                    "spec.namespace cannot be empty when set",
                ));
            }
        }
        Ok(())
    }

    /// Effective namespace on the target cluster
    pub fn target_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_ADDON_NAMESPACE)
    }
}

/// Lifecycle phase of a MeshAddon
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum AddonPhase {
    /// First install has not been attempted yet
    #[default]
    Initializing,
    /// Installed, waiting for the deployment to become available
    Checking,
    /// Install failed, waiting to tear down and retry
    Reinitializing,
    /// Healthy and on the desired version
    Running,
    /// Rolling the deployment to a new version
    Upgrading,
    /// Gave up; needs manual intervention
    Failed,
}

impl std::fmt::Display for AddonPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Checking => write!(f, "Checking"),
            Self::Reinitializing => write!(f, "Reinitializing"),
            Self::Running => write!(f, "Running"),
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for a MeshAddon
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshAddonStatus {
    /// Current phase; absent means Initializing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<AddonPhase>,

    /// Human-readable reason for the last failure, empty when healthy
    #[serde(default)]
    pub reason: String,

    /// Install attempts consumed, in `0..=5`
    #[serde(default)]
    pub retry_count: u32,

    /// Version last successfully rolled out
    #[serde(default)]
    pub deployed_version: String,

    /// When the last failed install was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reinit_timestamp: Option<DateTime<Utc>>,
}

impl MeshAddonStatus {
    /// Phase with the empty value mapped to Initializing
    pub fn effective_phase(&self) -> AddonPhase {
        self.phase.unwrap_or_default()
    }
}

impl MeshAddon {
    /// Validate the spec against this object's name
    pub fn validate(&self) -> crate::Result<()> {
        self.spec.validate(&self.name_any())
    }

    /// Effective phase of the addon (Initializing when no status yet)
    pub fn phase(&self) -> AddonPhase {
        self.status
            .as_ref()
            .map(MeshAddonStatus::effective_phase)
            .unwrap_or_default()
    }

    /// Status, or the default empty status
    pub fn status_or_default(&self) -> MeshAddonStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Object UID, empty when the object has not been persisted
    pub fn uid_or_default(&self) -> String {
        self.uid().unwrap_or_default()
    }

    /// Queue key for this object
    pub fn key(&self) -> String {
        crate::addon_key(self.namespace().as_deref(), &self.name_any())
    }
}
