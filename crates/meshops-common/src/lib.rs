//! Common types for meshops: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod key;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use key::{addon_key, split_key};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for meshops system resources (operator, cluster kubeconfigs)
pub const MESHOPS_SYSTEM_NAMESPACE: &str = "meshops-system";

/// Namespace the mesh-manager addon is installed into when `spec.namespace` is unset
pub const DEFAULT_ADDON_NAMESPACE: &str = "mesh-system";

/// Field manager used for every server-side apply issued by meshops
pub const FIELD_MANAGER: &str = "meshops-controller";

/// Label key marking resources owned by a MeshAddon
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label value for [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "meshops";
