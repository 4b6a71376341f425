//! Custom Resource Definitions for meshops

mod addon;

pub use addon::{
    AddonPhase, BackendConfig, MeshAddon, MeshAddonSpec, MeshAddonStatus, MAX_RETRY_COUNT,
};
