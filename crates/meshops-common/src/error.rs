//! Error types for meshops
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the addon or cluster they concern so that log lines and
//! `status.reason` read without extra context.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for meshops operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a MeshAddon spec
    #[error("validation error for {addon}: {message}")]
    Validation {
        /// Name of the addon with invalid configuration
        addon: String,
        /// Description of what's invalid
        message: String,
    },

    /// Could not resolve or connect to a target cluster
    #[error("connection error for cluster {cluster}: {message}")]
    Connection {
        /// Target cluster name
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The object no longer exists
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Optimistic concurrency conflict on write
    #[error("conflict updating {name}: {message}")]
    Conflict {
        /// Resource name
        name: String,
        /// Server message
        message: String,
    },

    /// Install, uninstall or upgrade of the addon on a target cluster failed
    #[error("install error for {addon} on {cluster}: {message}")]
    Install {
        /// Addon name
        addon: String,
        /// Target cluster name
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Topology registry fetch failed
    #[error("topology error: {message}")]
    Topology {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "queue", "controller", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error for an addon
    pub fn validation_for(addon: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            addon: addon.into(),
            message: msg.into(),
        }
    }

    /// Create a connection error for a cluster
    pub fn connection(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an install error with addon and cluster context
    pub fn install(
        addon: impl Into<String>,
        cluster: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Install {
            addon: addon.into(),
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a topology error
    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True when the object being operated on is already gone.
    ///
    /// Covers both the explicit variant and raw 404s from the API server.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => is_api_code(source, 404),
            _ => false,
        }
    }

    /// True for optimistic-concurrency conflicts (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube { source } => is_api_code(source, 409),
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec or code fix.
    /// Conflicts are not retried in place: the caller must re-read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::Validation { .. } => false,
            Error::Connection { .. } => true,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => false,
            Error::Install { .. } => true,
            Error::Topology { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Connection { cluster, .. } => Some(cluster),
            Error::Install { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

/// Whether a kube error is an API response with the given HTTP status code
pub fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn not_found_covers_variant_and_raw_404() {
        assert!(Error::not_found("Deployment", "mesh-manager").is_not_found());
        assert!(Error::from(api_error(404)).is_not_found());
        assert!(!Error::from(api_error(500)).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn conflict_covers_variant_and_raw_409() {
        assert!(Error::conflict("mm-1", "resourceVersion changed").is_conflict());
        assert!(Error::from(api_error(409)).is_conflict());
        assert!(!Error::from(api_error(404)).is_conflict());
    }

    #[test]
    fn retryability() {
        assert!(!Error::validation_for("mm-1", "empty cluster").is_retryable());
        assert!(!Error::conflict("mm-1", "stale").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(Error::connection("east", "timeout").is_retryable());
        assert!(Error::install("mm-1", "east", "deployment rejected").is_retryable());
        assert!(Error::from(api_error(503)).is_retryable());
        assert!(!Error::from(api_error(403)).is_retryable());
    }

    #[test]
    fn messages_carry_context() {
        let err = Error::install("mm-1", "east", "quota exceeded");
        assert_eq!(err.cluster(), Some("east"));
        let msg = err.to_string();
        assert!(msg.contains("mm-1"));
        assert!(msg.contains("east"));
        assert!(msg.contains("quota exceeded"));

        let err = Error::internal_with_context("queue", "shut down");
        assert!(err.to_string().contains("[queue]"));
        assert_eq!(Error::internal("x").cluster(), None);
    }
}
