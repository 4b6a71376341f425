//! MeshAddon reconciliation controller
//!
//! Workers pull keys from the [`WorkQueue`] and call [`AddonController::sync`].
//! A sync either acts inline (install, start upgrade) or starts a background
//! task (reinit, checking, health watch, upgrade rollout) guarded so that at
//! most one task of each kind runs per key. Background tasks never occupy a
//! worker, observe the controller's cancellation token, and re-enqueue their
//! key when they finish so the next phase is picked up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use meshops_common::crd::{AddonPhase, MeshAddon, MeshAddonStatus};
use meshops_common::retry::{retry_with_backoff_if, RetryConfig};
use meshops_common::Error;

use crate::deployer::{AddonDeployer, AddonTarget};
use crate::guard::{BackgroundTask, TaskGuard};
use crate::lifecycle::{self, Action};
use crate::queue::WorkQueue;
use crate::store::{ResourceCache, ResourceWriter};
use crate::watch::EventHandler;

/// Timings of the lifecycle phases
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Minimum spacing between reinstall attempts
    pub reinit_timeout: Duration,
    /// Interval between availability polls while Checking
    pub check_interval: Duration,
    /// Lifetime of one Checking task before it hands back to the queue
    pub check_timeout: Duration,
    /// Time Checking may stay unhealthy before the reason is recorded
    pub check_grace: Duration,
    /// Interval between rollout attempts while Upgrading
    pub upgrade_interval: Duration,
    /// Time after which a failing rollout moves the addon to Failed
    pub upgrade_timeout: Duration,
    /// Interval of the Running health watch
    pub health_interval: Duration,
    /// Retry policy of a single status write
    pub status_retry: RetryConfig,
    /// Poll interval while waiting for the resource cache to sync
    pub sync_poll: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reinit_timeout: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(5),
            check_timeout: Duration::from_secs(5 * 60 + 10),
            check_grace: Duration::from_secs(5 * 60),
            upgrade_interval: Duration::from_secs(5),
            upgrade_timeout: Duration::from_secs(5 * 60),
            health_interval: Duration::from_secs(5 * 60),
            status_retry: RetryConfig::fixed(5, Duration::from_secs(1)),
            sync_poll: Duration::from_millis(100),
        }
    }
}

/// Last successfully processed state of a key
#[derive(Clone, Debug)]
struct CachedAddon {
    uid: String,
    target: AddonTarget,
}

/// Result of a status write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Persisted {
    Updated,
    Unchanged,
    /// The object no longer exists
    Gone,
    /// The object was recreated or moved to another phase meanwhile
    Superseded,
}

/// How a background task ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskEnd {
    Requeue,
    PersistFailed,
    Cancelled,
}

/// Drives MeshAddon objects through their lifecycle
pub struct AddonController {
    cache: Arc<dyn ResourceCache>,
    writer: Arc<dyn ResourceWriter>,
    deployer: Arc<dyn AddonDeployer>,
    queue: Arc<WorkQueue>,
    known: Mutex<HashMap<String, CachedAddon>>,
    /// Resource version each key had before our last status write
    written_over: Mutex<HashMap<String, String>>,
    guards: TaskGuard,
    config: ControllerConfig,
    cancel: CancellationToken,
}

impl AddonController {
    /// Create a controller
    pub fn new(
        cache: Arc<dyn ResourceCache>,
        writer: Arc<dyn ResourceWriter>,
        deployer: Arc<dyn AddonDeployer>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            cache,
            writer,
            deployer,
            queue: Arc::new(WorkQueue::new()),
            known: Mutex::new(HashMap::new()),
            written_over: Mutex::new(HashMap::new()),
            guards: TaskGuard::new(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Queue `key` for a sync
    pub fn enqueue(&self, key: &str) {
        self.queue.add(key);
    }

    /// Background task guards
    pub fn guards(&self) -> &TaskGuard {
        &self.guards
    }

    /// Wait for the cache to sync, then run `workers` sync loops until `stop` fires.
    ///
    /// On stop the queue is shut down, every background task is cancelled, and
    /// this returns once in-flight syncs have finished.
    pub async fn run(self: Arc<Self>, workers: usize, stop: CancellationToken) {
        while !self.cache.has_synced() {
            tokio::select! {
                _ = stop.cancelled() => {
                    self.shut_down();
                    return;
                }
                _ = tokio::time::sleep(self.config.sync_poll) => {}
            }
        }
        info!(workers, "resource cache synced, starting workers");

        for addon in self.cache.list() {
            self.enqueue(&addon.key());
        }

        let mut pool = JoinSet::new();
        for id in 0..workers.max(1) {
            let this = Arc::clone(&self);
            pool.spawn(async move { this.worker(id).await });
        }

        stop.cancelled().await;
        info!("stopping addon controller");
        self.shut_down();
        while pool.join_next().await.is_some() {}
        info!("addon controller stopped");
    }

    fn shut_down(&self) {
        self.cancel.cancel();
        self.queue.shut_down();
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "worker started");
        while let Some(key) = self.queue.next().await {
            match self.sync(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    warn!(
                        addon = %key,
                        cluster = e.cluster().unwrap_or_default(),
                        retries = self.queue.num_requeues(&key),
                        error = %e,
                        "sync failed, requeueing with backoff"
                    );
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }
        debug!(worker = id, "worker stopped");
    }

    /// Reconcile one key
    #[instrument(skip_all, fields(addon = %key))]
    pub async fn sync(self: &Arc<Self>, key: &str) -> Result<(), Error> {
        let Some(addon) = self.cache.get(key) else {
            return self.remove(key).await;
        };

        if self.cache_is_behind(key, &addon) {
            debug!("cache has not seen our last status write yet, waiting for the watch");
            return Ok(());
        }

        let uid = addon.uid_or_default();
        let previous = self.known.lock().get(key).cloned();
        if let Some(previous) = previous {
            if previous.uid != uid {
                info!(old_uid = %previous.uid, new_uid = %uid, "addon recreated, tearing down old install");
                self.remove(key).await?;
            }
        }

        if let Err(e) = addon.validate() {
            warn!(error = %e, "invalid MeshAddon spec");
            let reason = match e {
                Error::Validation { message, .. } => format!("invalid spec: {}", message),
                other => format!("invalid spec: {}", other),
            };
            let phase = addon.phase();
            self.persist(key, &uid, phase, move |s: &mut MeshAddonStatus| s.reason = reason.clone())
                .await?;
            return Ok(());
        }

        self.known.lock().insert(
            key.to_string(),
            CachedAddon {
                uid,
                target: AddonTarget::of(&addon),
            },
        );

        self.dispatch(key, addon).await
    }

    fn cache_is_behind(&self, key: &str, addon: &MeshAddon) -> bool {
        let mut written_over = self.written_over.lock();
        match (written_over.get(key), addon.resource_version()) {
            (Some(stale), Some(current)) if *stale == current => true,
            (Some(_), _) => {
                written_over.remove(key);
                false
            }
            _ => false,
        }
    }

    async fn dispatch(self: &Arc<Self>, key: &str, addon: Arc<MeshAddon>) -> Result<(), Error> {
        let status = addon.status_or_default();
        let action = lifecycle::plan(&addon.spec, &status);
        debug!(phase = %status.effective_phase(), ?action, "dispatching");

        match action {
            Action::Install => self.install(key, &addon).await,
            Action::Reinit => {
                let delay = lifecycle::reinit_delay(
                    status.last_reinit_timestamp,
                    Utc::now(),
                    self.config.reinit_timeout,
                );
                self.spawn_task(key, BackgroundTask::Reinit, addon, move |this, key, addon| async move {
                    this.reinit(&key, &addon, delay).await
                });
                Ok(())
            }
            Action::Check => {
                self.spawn_task(key, BackgroundTask::Checking, addon, |this, key, addon| async move {
                    this.check(&key, &addon).await
                });
                Ok(())
            }
            Action::BeginUpgrade => {
                info!(
                    from = %status.deployed_version,
                    to = %addon.spec.version,
                    "version changed, upgrading"
                );
                self.persist(key, &addon.uid_or_default(), AddonPhase::Running, lifecycle::begin_upgrade)
                    .await
                    .map(|_| ())
            }
            Action::WatchHealth => {
                self.spawn_task(key, BackgroundTask::HealthWatch, addon, |this, key, addon| async move {
                    this.watch_health(&key, &addon).await
                });
                Ok(())
            }
            Action::Upgrade => {
                self.spawn_task(key, BackgroundTask::Upgrade, addon, |this, key, addon| async move {
                    this.upgrade(&key, &addon).await
                });
                Ok(())
            }
            Action::Halt => {
                for task in [BackgroundTask::HealthWatch, BackgroundTask::Checking, BackgroundTask::Upgrade] {
                    self.guards.clear(key, task);
                }
                debug!(reason = %status.reason, "addon failed, no further action");
                Ok(())
            }
        }
    }

    /// Tear down whatever the last processed object for `key` installed
    async fn remove(&self, key: &str) -> Result<(), Error> {
        let cached = self.known.lock().remove(key);
        self.written_over.lock().remove(key);
        self.guards.release_all(key);

        let Some(cached) = cached else {
            debug!("no cached state, nothing to tear down");
            return Ok(());
        };

        self.deployer.uninstall(&cached.target).await?;
        info!(cluster = %cached.target.cluster, uid = %cached.uid, "removed mesh manager");
        Ok(())
    }

    async fn install(&self, key: &str, addon: &MeshAddon) -> Result<(), Error> {
        let uid = addon.uid_or_default();
        match self.deployer.install(addon).await {
            Ok(()) => {
                let version = addon.spec.version.clone();
                self.persist(key, &uid, AddonPhase::Initializing, move |s: &mut MeshAddonStatus| {
                    lifecycle::install_succeeded(s, &version)
                })
                .await?;
            }
            Err(e) => {
                warn!(cluster = %addon.spec.cluster, phase = %AddonPhase::Initializing, error = %e, "install failed");
                let reason = e.to_string();
                let now = Utc::now();
                self.persist(key, &uid, AddonPhase::Initializing, move |s: &mut MeshAddonStatus| {
                    lifecycle::install_failed(s, &reason, now)
                })
                .await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    fn spawn_task<F, Fut>(self: &Arc<Self>, key: &str, task: BackgroundTask, addon: Arc<MeshAddon>, body: F)
    where
        F: FnOnce(Arc<Self>, String, Arc<MeshAddon>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = TaskEnd> + Send + 'static,
    {
        let Some(token) = self.guards.try_acquire(key, task) else {
            debug!(%task, "background task already running");
            return;
        };

        let this = Arc::clone(self);
        let key = key.to_string();
        let span = info_span!("addon_task", addon = %key, %task);
        tokio::spawn(
            async move {
                debug!("background task started");
                let end = body(Arc::clone(&this), key.clone(), addon).await;
                this.guards.release(&key, task, token);
                match end {
                    TaskEnd::Requeue => this.queue.add(&key),
                    TaskEnd::PersistFailed => this.queue.add_rate_limited(&key),
                    TaskEnd::Cancelled => debug!("background task cancelled"),
                }
            }
            .instrument(span),
        );
    }

    /// Sleep for `duration`; false when cancelled first
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Current object for `key` if it is still `uid` in `phase`
    fn current(&self, key: &str, uid: &str, phase: AddonPhase) -> Option<Arc<MeshAddon>> {
        self.cache
            .get(key)
            .filter(|a| a.uid_or_default() == uid && a.phase() == phase)
    }

    /// Persist from a background task and translate the outcome
    async fn finish<F>(&self, key: &str, uid: &str, phase: AddonPhase, mutate: F) -> TaskEnd
    where
        F: Fn(&mut MeshAddonStatus) + Send + Sync,
    {
        match self.persist(key, uid, phase, mutate).await {
            Ok(outcome) => {
                debug!(?outcome, "background status write");
                TaskEnd::Requeue
            }
            Err(e) => {
                warn!(phase = %phase, error = %e, "failed to persist status");
                TaskEnd::PersistFailed
            }
        }
    }

    async fn reinit(&self, key: &str, addon: &MeshAddon, delay: Duration) -> TaskEnd {
        debug!(delay_ms = delay.as_millis(), "reinstall scheduled");
        if !self.pause(delay).await {
            return TaskEnd::Cancelled;
        }

        let uid = addon.uid_or_default();
        let Some(current) = self.current(key, &uid, AddonPhase::Reinitializing) else {
            return TaskEnd::Requeue;
        };

        let target = AddonTarget::of(&current);
        let result = match self.deployer.uninstall(&target).await {
            Ok(()) => self.deployer.install(&current).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(cluster = %target.cluster, "reinstall succeeded");
                let version = current.spec.version.clone();
                self.finish(key, &uid, AddonPhase::Reinitializing, move |s: &mut MeshAddonStatus| {
                    lifecycle::reinit_succeeded(s, &version)
                })
                .await
            }
            Err(e) => {
                let retries = current.status_or_default().retry_count;
                warn!(
                    cluster = %target.cluster,
                    phase = %AddonPhase::Reinitializing,
                    retries,
                    error = %e,
                    "reinstall failed"
                );
                let reason = e.to_string();
                let now = Utc::now();
                self.finish(key, &uid, AddonPhase::Reinitializing, move |s: &mut MeshAddonStatus| {
                    lifecycle::reinit_failed(s, &reason, now)
                })
                .await
            }
        }
    }

    async fn check(&self, key: &str, addon: &MeshAddon) -> TaskEnd {
        let uid = addon.uid_or_default();
        let target = AddonTarget::of(addon);
        let started = Instant::now();
        let mut overdue_recorded = addon.status_or_default().reason == lifecycle::REASON_UNHEALTHY_IN_CHECK;

        loop {
            if self.current(key, &uid, AddonPhase::Checking).is_none() {
                return TaskEnd::Requeue;
            }

            match self.deployer.is_healthy(&target).await {
                Ok(true) => {
                    info!(cluster = %target.cluster, "mesh manager available");
                    return self
                        .finish(key, &uid, AddonPhase::Checking, lifecycle::checking_healthy)
                        .await;
                }
                Ok(false) => debug!("mesh manager not yet available"),
                Err(e) => debug!(error = %e, "availability probe failed"),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.check_grace && !overdue_recorded {
                warn!(cluster = %target.cluster, phase = %AddonPhase::Checking, "mesh manager still unavailable after grace period");
                match self
                    .persist(key, &uid, AddonPhase::Checking, lifecycle::checking_overdue)
                    .await
                {
                    Ok(Persisted::Gone | Persisted::Superseded) => return TaskEnd::Requeue,
                    Ok(_) => overdue_recorded = true,
                    Err(e) => {
                        warn!(error = %e, "failed to persist status");
                        return TaskEnd::PersistFailed;
                    }
                }
            }
            if elapsed >= self.config.check_timeout {
                debug!("checking window elapsed, handing back to the queue");
                return TaskEnd::Requeue;
            }

            if !self.pause(self.config.check_interval).await {
                return TaskEnd::Cancelled;
            }
        }
    }

    async fn watch_health(&self, key: &str, addon: &MeshAddon) -> TaskEnd {
        let uid = addon.uid_or_default();
        let target = AddonTarget::of(addon);

        loop {
            if !self.pause(self.config.health_interval).await {
                return TaskEnd::Cancelled;
            }
            if self.current(key, &uid, AddonPhase::Running).is_none() {
                return TaskEnd::Requeue;
            }

            let healthy = match self.deployer.is_healthy(&target).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(cluster = %target.cluster, error = %e, "health probe failed");
                    false
                }
            };
            if !healthy {
                warn!(cluster = %target.cluster, phase = %AddonPhase::Running, "mesh manager unhealthy");
                return self
                    .finish(key, &uid, AddonPhase::Running, lifecycle::watch_unhealthy)
                    .await;
            }
        }
    }

    async fn upgrade(&self, key: &str, addon: &MeshAddon) -> TaskEnd {
        let uid = addon.uid_or_default();
        let target = AddonTarget::of(addon);
        let version = addon.spec.version.clone();
        let deadline = Instant::now() + self.config.upgrade_timeout;

        loop {
            if self.current(key, &uid, AddonPhase::Upgrading).is_none() {
                return TaskEnd::Requeue;
            }

            match self.deployer.upgrade(&target, &version).await {
                Ok(()) => {
                    let version = version.clone();
                    return self
                        .finish(key, &uid, AddonPhase::Upgrading, move |s: &mut MeshAddonStatus| {
                            lifecycle::upgrade_succeeded(s, &version)
                        })
                        .await;
                }
                Err(e) => debug!(error = %e, "upgrade attempt failed"),
            }

            if Instant::now() >= deadline {
                warn!(cluster = %target.cluster, phase = %AddonPhase::Upgrading, version = %version, "upgrade deadline passed");
                return self
                    .finish(key, &uid, AddonPhase::Upgrading, lifecycle::upgrade_failed)
                    .await;
            }
            if !self.pause(self.config.upgrade_interval).await {
                return TaskEnd::Cancelled;
            }
        }
    }

    // =========================================================================
    // Status persistence
    // =========================================================================

    /// Apply `mutate` to the latest cached copy of `key` and write its status.
    ///
    /// Nothing is written when the object is gone, was recreated (`uid`
    /// differs) or has left `phase`. A NotFound answer counts as success.
    /// Conflicts are returned at once so the caller can retry on fresh data.
    async fn persist<F>(&self, key: &str, uid: &str, phase: AddonPhase, mutate: F) -> Result<Persisted, Error>
    where
        F: Fn(&mut MeshAddonStatus) + Send + Sync,
    {
        let mutate = &mutate;
        retry_with_backoff_if(
            &self.config.status_retry,
            "update_status",
            Error::is_retryable,
            move || async move {
                let Some(current) = self.cache.get(key) else {
                    return Ok(Persisted::Gone);
                };
                if current.uid_or_default() != uid || current.phase() != phase {
                    return Ok(Persisted::Superseded);
                }

                let mut status = current.status_or_default();
                mutate(&mut status);
                if current.status.as_ref() == Some(&status) {
                    return Ok(Persisted::Unchanged);
                }

                let mut updated = (*current).clone();
                updated.status = Some(status);
                match self.writer.update_status(&updated).await {
                    Ok(_) => {
                        if let Some(rv) = current.resource_version() {
                            self.written_over.lock().insert(key.to_string(), rv);
                        }
                        Ok(Persisted::Updated)
                    }
                    Err(e) if e.is_not_found() => Ok(Persisted::Gone),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }
}

impl EventHandler for AddonController {
    fn on_added(&self, addon: &MeshAddon) {
        self.enqueue(&addon.key());
    }

    fn on_updated(&self, old: &MeshAddon, new: &MeshAddon) {
        if old == new {
            return;
        }
        self.enqueue(&new.key());
    }

    fn on_deleted(&self, addon: &MeshAddon) {
        self.enqueue(&addon.key());
    }
}
