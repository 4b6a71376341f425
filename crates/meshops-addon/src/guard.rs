//! Per-key background task guards

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Kinds of long-running background work started by a sync
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackgroundTask {
    /// Delayed uninstall + reinstall
    Reinit,
    /// Polling for the deployment to become available
    Checking,
    /// Periodic health probe while Running
    HealthWatch,
    /// Rolling the deployment image
    Upgrade,
}

impl fmt::Display for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reinit => "reinit",
            Self::Checking => "checking",
            Self::HealthWatch => "health-watch",
            Self::Upgrade => "upgrade",
        };
        f.write_str(s)
    }
}

/// Proof of holding a guard, handed back on release
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuardToken(u64);

/// At most one background task per (key, task kind)
///
/// Each acquisition gets a fresh token. A task releasing with a token that
/// was cleared and handed out again in the meantime leaves the newer holder
/// in place.
#[derive(Debug, Default)]
pub struct TaskGuard {
    active: DashMap<(String, BackgroundTask), u64>,
    generation: AtomicU64,
}

impl TaskGuard {
    /// Create an empty guard set
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(key, task)`. Returns `None` when it is already held.
    pub fn try_acquire(&self, key: &str, task: BackgroundTask) -> Option<GuardToken> {
        use dashmap::mapref::entry::Entry;

        match self.active.entry((key.to_string(), task)) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(generation);
                Some(GuardToken(generation))
            }
        }
    }

    /// Release `(key, task)` if `token` still holds it
    pub fn release(&self, key: &str, task: BackgroundTask, token: GuardToken) {
        self.active
            .remove_if(&(key.to_string(), task), |_, held| *held == token.0);
    }

    /// Release `(key, task)` whoever holds it
    pub fn clear(&self, key: &str, task: BackgroundTask) {
        self.active.remove(&(key.to_string(), task));
    }

    /// Release every guard held for `key`
    pub fn release_all(&self, key: &str) {
        self.active.retain(|(k, _), _| k != key);
    }

    /// Whether `(key, task)` is held
    pub fn is_held(&self, key: &str, task: BackgroundTask) -> bool {
        self.active.contains_key(&(key.to_string(), task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let guard = TaskGuard::new();
        let token = guard.try_acquire("mm-1", BackgroundTask::Checking).unwrap();
        assert!(guard.try_acquire("mm-1", BackgroundTask::Checking).is_none());

        guard.release("mm-1", BackgroundTask::Checking, token);
        assert!(guard.try_acquire("mm-1", BackgroundTask::Checking).is_some());
    }

    #[test]
    fn tasks_and_keys_are_independent() {
        let guard = TaskGuard::new();
        assert!(guard.try_acquire("mm-1", BackgroundTask::Checking).is_some());
        assert!(guard.try_acquire("mm-1", BackgroundTask::HealthWatch).is_some());
        assert!(guard.try_acquire("mm-2", BackgroundTask::Checking).is_some());
    }

    #[test]
    fn release_all_clears_only_that_key() {
        let guard = TaskGuard::new();
        guard.try_acquire("mm-1", BackgroundTask::Upgrade);
        guard.try_acquire("mm-1", BackgroundTask::HealthWatch);
        guard.try_acquire("mm-2", BackgroundTask::Upgrade);

        guard.release_all("mm-1");

        assert!(!guard.is_held("mm-1", BackgroundTask::Upgrade));
        assert!(!guard.is_held("mm-1", BackgroundTask::HealthWatch));
        assert!(guard.is_held("mm-2", BackgroundTask::Upgrade));
    }

    /// Story: a task outlives a teardown that cleared its guard. A new task
    /// takes the guard, and the old task finishing must not free it.
    #[test]
    fn stale_token_does_not_release_newer_holder() {
        let guard = TaskGuard::new();
        let old = guard.try_acquire("mm-1", BackgroundTask::Checking).unwrap();

        guard.release_all("mm-1");
        let new = guard.try_acquire("mm-1", BackgroundTask::Checking).unwrap();
        assert_ne!(old, new);

        guard.release("mm-1", BackgroundTask::Checking, old);
        assert!(guard.is_held("mm-1", BackgroundTask::Checking));

        guard.release("mm-1", BackgroundTask::Checking, new);
        assert!(!guard.is_held("mm-1", BackgroundTask::Checking));
    }

    #[test]
    fn clear_releases_regardless_of_token() {
        let guard = TaskGuard::new();
        guard.try_acquire("mm-1", BackgroundTask::HealthWatch);

        guard.clear("mm-1", BackgroundTask::HealthWatch);

        assert!(!guard.is_held("mm-1", BackgroundTask::HealthWatch));
    }
}
