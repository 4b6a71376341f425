//! Watch driver: keeps the reflector store current and emits change callbacks
//!
//! Events are applied to the store before the handler is called, so a sync
//! triggered by a callback always reads the new state. During a (re)list the
//! callbacks are held back until the fresh snapshot has replaced the store;
//! objects that vanished while the watch was down are reported as deleted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use meshops_common::crd::MeshAddon;

/// Receives add/update/delete notifications for MeshAddon objects
#[cfg_attr(test, automock)]
pub trait EventHandler: Send + Sync {
    /// A new object appeared
    fn on_added(&self, addon: &MeshAddon);
    /// An existing object changed
    fn on_updated(&self, old: &MeshAddon, new: &MeshAddon);
    /// An object was removed
    fn on_deleted(&self, addon: &MeshAddon);
}

/// Store half handed out by [`crate::store::KubeResourceCache::new`]
pub struct WatchSource {
    store: Store<MeshAddon>,
    writer: Writer<MeshAddon>,
    synced: Arc<AtomicBool>,
}

impl WatchSource {
    pub(crate) fn new(store: Store<MeshAddon>, writer: Writer<MeshAddon>, synced: Arc<AtomicBool>) -> Self {
        Self {
            store,
            writer,
            synced,
        }
    }

    /// Attach the handler that will receive callbacks
    pub fn into_driver(self, handler: Arc<dyn EventHandler>) -> WatchDriver {
        WatchDriver {
            store: self.store,
            writer: self.writer,
            synced: self.synced,
            handler,
            relist: None,
        }
    }
}

enum Change {
    Added(MeshAddon),
    Updated(Arc<MeshAddon>, MeshAddon),
    Deleted(MeshAddon),
}

struct Relist {
    previous: HashMap<ObjectRef<MeshAddon>, Arc<MeshAddon>>,
    pending: Vec<Change>,
}

/// Applies watcher events to the store and notifies the handler
pub struct WatchDriver {
    store: Store<MeshAddon>,
    writer: Writer<MeshAddon>,
    synced: Arc<AtomicBool>,
    handler: Arc<dyn EventHandler>,
    relist: Option<Relist>,
}

impl WatchDriver {
    /// Watch every MeshAddon until `cancel` fires
    pub async fn run(mut self, api: Api<MeshAddon>, cancel: CancellationToken) {
        info!("starting MeshAddon watch");
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => warn!(error = %e, "MeshAddon watch error, backing off"),
                    None => break,
                },
            }
        }
        info!("MeshAddon watch stopped");
    }

    /// Apply one watcher event
    pub fn handle(&mut self, event: Event<MeshAddon>) {
        match &event {
            Event::Init => {
                let previous = self
                    .store
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(&*obj), obj))
                    .collect();
                self.relist = Some(Relist {
                    previous,
                    pending: Vec::new(),
                });
                self.writer.apply_watcher_event(&event);
            }
            Event::InitApply(obj) => {
                let change = match self.store.get(&ObjectRef::from_obj(obj)) {
                    Some(old) => Change::Updated(old, obj.clone()),
                    None => Change::Added(obj.clone()),
                };
                if let Some(relist) = self.relist.as_mut() {
                    relist.previous.remove(&ObjectRef::from_obj(obj));
                    relist.pending.push(change);
                }
                self.writer.apply_watcher_event(&event);
            }
            Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                self.synced.store(true, Ordering::Release);

                if let Some(relist) = self.relist.take() {
                    debug!(
                        objects = relist.pending.len(),
                        vanished = relist.previous.len(),
                        "MeshAddon list applied"
                    );
                    for change in relist.pending {
                        self.notify(change);
                    }
                    for (_, gone) in relist.previous {
                        self.notify(Change::Deleted((*gone).clone()));
                    }
                }
            }
            Event::Apply(obj) => {
                let old = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                match old {
                    Some(old) => self.notify(Change::Updated(old, obj.clone())),
                    None => self.notify(Change::Added(obj.clone())),
                }
            }
            Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.notify(Change::Deleted(obj.clone()));
            }
        }
    }

    fn notify(&self, change: Change) {
        match change {
            Change::Added(obj) => self.handler.on_added(&obj),
            Change::Updated(old, new) => self.handler.on_updated(&old, &new),
            Change::Deleted(obj) => self.handler.on_deleted(&obj),
        }
    }
}
