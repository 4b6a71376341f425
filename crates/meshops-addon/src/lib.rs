//! MeshAddon lifecycle controller
//!
//! Installs a mesh manager on the target cluster named by each MeshAddon and
//! drives it through Initializing, Checking, Running, Upgrading,
//! Reinitializing and Failed. The pieces:
//!
//! - [`lifecycle`]: pure phase transitions
//! - [`queue::WorkQueue`]: deduplicating, rate-limited key queue
//! - [`guard::TaskGuard`]: one background task of each kind per key
//! - [`store`] and [`watch`]: reflector-backed read cache and status writer
//! - [`deployer`]: what gets installed on the target cluster
//! - [`controller::AddonController`]: workers and background tasks tying it together

pub mod controller;
pub mod deployer;
pub mod guard;
pub mod lifecycle;
pub mod queue;
pub mod store;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{AddonController, ControllerConfig};
pub use deployer::{AddonDeployer, AddonTarget, KubeAddonDeployer};
pub use guard::{BackgroundTask, GuardToken, TaskGuard};
pub use queue::WorkQueue;
pub use store::{KubeResourceCache, KubeResourceWriter, ResourceCache, ResourceWriter};
pub use watch::{EventHandler, WatchDriver, WatchSource};
