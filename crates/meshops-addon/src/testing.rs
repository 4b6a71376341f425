//! In-memory doubles for controller tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;

use meshops_common::crd::{AddonPhase, BackendConfig, MeshAddon, MeshAddonSpec, MeshAddonStatus};
use meshops_common::Error;

use crate::deployer::{AddonDeployer, AddonTarget};
use crate::store::{ResourceCache, ResourceWriter};
use crate::watch::EventHandler;

/// Build an addon targeting `east`
pub(crate) fn addon(name: &str, uid: &str, version: &str, status: Option<MeshAddonStatus>) -> MeshAddon {
    let mut addon = MeshAddon::new(
        name,
        MeshAddonSpec {
            cluster: "east".to_string(),
            version: version.to_string(),
            namespace: None,
            backend: BackendConfig::default(),
        },
    );
    addon.metadata.uid = Some(uid.to_string());
    addon.status = status;
    addon
}

/// Status in `phase` with `deployed` recorded
pub(crate) fn status(phase: AddonPhase, deployed: &str) -> MeshAddonStatus {
    MeshAddonStatus {
        phase: Some(phase),
        deployed_version: deployed.to_string(),
        ..Default::default()
    }
}

/// Resource store that behaves like the API server plus a watch
#[derive(Default)]
pub(crate) struct FakeStore {
    objects: Mutex<HashMap<String, MeshAddon>>,
    version: AtomicU64,
    synced: AtomicBool,
    reject_writes: AtomicBool,
    write_attempts: AtomicU32,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
}

impl FakeStore {
    pub(crate) fn synced() -> Arc<Self> {
        let store = Self::default();
        store.synced.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    /// Deliver watch callbacks to `handler` from now on
    pub(crate) fn watch(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.lock() = Some(handler);
    }

    pub(crate) fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Answer every status write with a conflict
    pub(crate) fn reject_writes(&self) {
        self.reject_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn write_attempts(&self) -> u32 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.lock().clone()
    }

    /// Create or replace an object, as a user would
    pub(crate) fn put(&self, mut addon: MeshAddon) {
        addon.metadata.resource_version = Some(self.next_version());
        let key = addon.key();
        let old = self.objects.lock().insert(key, addon.clone());
        if let Some(handler) = self.handler() {
            match old {
                Some(old) => handler.on_updated(&old, &addon),
                None => handler.on_added(&addon),
            }
        }
    }

    /// Delete an object, as a user would
    pub(crate) fn delete(&self, key: &str) {
        let old = self.objects.lock().remove(key);
        if let (Some(old), Some(handler)) = (old, self.handler()) {
            handler.on_deleted(&old);
        }
    }

    pub(crate) fn status(&self, key: &str) -> MeshAddonStatus {
        self.objects
            .lock()
            .get(key)
            .and_then(|a| a.status.clone())
            .unwrap_or_default()
    }
}

impl ResourceCache for FakeStore {
    fn get(&self, key: &str) -> Option<Arc<MeshAddon>> {
        self.objects.lock().get(key).cloned().map(Arc::new)
    }

    fn list(&self) -> Vec<Arc<MeshAddon>> {
        self.objects.lock().values().cloned().map(Arc::new).collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceWriter for FakeStore {
    async fn update_status(&self, addon: &MeshAddon) -> Result<MeshAddon, Error> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let key = addon.key();
        let (old, new) = {
            let mut objects = self.objects.lock();
            let Some(stored) = objects.get_mut(&key) else {
                return Err(Error::not_found("MeshAddon", addon.name_any()));
            };
            if self.reject_writes.load(Ordering::SeqCst)
                || stored.resource_version() != addon.resource_version()
            {
                return Err(Error::conflict(addon.name_any(), "resource version mismatch"));
            }
            let old = stored.clone();
            stored.status = addon.status.clone();
            stored.metadata.resource_version = Some(self.next_version());
            (old, stored.clone())
        };
        if let Some(handler) = self.handler() {
            handler.on_updated(&old, &new);
        }
        Ok(new)
    }
}

/// Deployer with scripted outcomes
pub(crate) struct FakeDeployer {
    install_failures: Mutex<VecDeque<String>>,
    uninstall_failures: Mutex<VecDeque<String>>,
    always_fail_install: AtomicBool,
    healthy: AtomicBool,
    upgrade_ok: AtomicBool,
    install_delay: Mutex<Duration>,
    pub(crate) installs: AtomicU32,
    pub(crate) upgrades: AtomicU32,
    pub(crate) health_probes: AtomicU32,
    pub(crate) uninstalls: Mutex<Vec<AddonTarget>>,
    pub(crate) calls: Mutex<Vec<&'static str>>,
    in_flight: Mutex<HashSet<String>>,
    pub(crate) overlapped: AtomicBool,
}

impl Default for FakeDeployer {
    fn default() -> Self {
        Self {
            install_failures: Mutex::new(VecDeque::new()),
            uninstall_failures: Mutex::new(VecDeque::new()),
            always_fail_install: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            upgrade_ok: AtomicBool::new(true),
            install_delay: Mutex::new(Duration::ZERO),
            installs: AtomicU32::new(0),
            upgrades: AtomicU32::new(0),
            health_probes: AtomicU32::new(0),
            uninstalls: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlapped: AtomicBool::new(false),
        }
    }
}

impl FakeDeployer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next_install(&self, reason: &str) {
        self.install_failures.lock().push_back(reason.to_string());
    }

    pub(crate) fn fail_next_uninstall(&self, reason: &str) {
        self.uninstall_failures.lock().push_back(reason.to_string());
    }

    pub(crate) fn fail_every_install(&self) {
        self.always_fail_install.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn set_upgrade_ok(&self, ok: bool) {
        self.upgrade_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn set_install_delay(&self, delay: Duration) {
        *self.install_delay.lock() = delay;
    }

    pub(crate) fn installs(&self) -> u32 {
        self.installs.load(Ordering::SeqCst)
    }

    pub(crate) fn uninstalled(&self) -> Vec<AddonTarget> {
        self.uninstalls.lock().clone()
    }
}

#[async_trait]
impl AddonDeployer for FakeDeployer {
    async fn install(&self, addon: &MeshAddon) -> Result<(), Error> {
        let key = addon.key();
        if !self.in_flight.lock().insert(key.clone()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let delay = *self.install_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.lock().remove(&key);

        self.installs.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push("install");
        let scripted = self.install_failures.lock().pop_front();
        if let Some(reason) = scripted {
            return Err(Error::install(&key, &addon.spec.cluster, reason));
        }
        if self.always_fail_install.load(Ordering::SeqCst) {
            return Err(Error::install(&key, &addon.spec.cluster, "image pull failed"));
        }
        Ok(())
    }

    async fn uninstall(&self, target: &AddonTarget) -> Result<(), Error> {
        self.calls.lock().push("uninstall");
        self.uninstalls.lock().push(target.clone());
        let scripted = self.uninstall_failures.lock().pop_front();
        if let Some(reason) = scripted {
            return Err(Error::install(&target.name, &target.cluster, reason));
        }
        Ok(())
    }

    async fn is_healthy(&self, _target: &AddonTarget) -> Result<bool, Error> {
        self.health_probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn upgrade(&self, target: &AddonTarget, _version: &str) -> Result<(), Error> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        if self.upgrade_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::install(&target.name, &target.cluster, "patch rejected"))
        }
    }
}
