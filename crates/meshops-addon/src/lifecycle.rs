//! MeshAddon lifecycle state machine
//!
//! Pure decision logic: [`plan`] maps the current phase (and spec) to the
//! action a sync should take, and the transition functions apply an action's
//! outcome to a status. Nothing here performs I/O, so every transition can be
//! tested without a cluster.
//!
//! ```text
//! Initializing ──ok──▶ Checking ──healthy──▶ Running ──version drift──▶ Upgrading
//!      │                  ▲  ▲                  │                          │
//!     err                 │  └──unhealthy watch─┘                          │
//!      ▼                  │                                                │
//! Reinitializing ──ok─────┘◀────────────────────────────ok─────────────────┘
//!      │                                                                   │
//!  retries exhausted ──▶ Failed ◀──────────────deadline passed─────────────┘
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use meshops_common::crd::{AddonPhase, MeshAddonSpec, MeshAddonStatus, MAX_RETRY_COUNT};

/// Reason recorded when reinstall attempts are exhausted
pub const REASON_RETRIES_EXHAUSTED: &str = "install error, retried max(5) times";
/// Reason recorded when Checking outlives its grace window
pub const REASON_UNHEALTHY_IN_CHECK: &str = "not healthy in status check";
/// Reason recorded when the Running health watch sees an unhealthy deployment
pub const REASON_UNHEALTHY_IN_WATCH: &str = "not healthy in watch";
/// Reason recorded when an upgrade misses its deadline
pub const REASON_UPGRADE_FAILED: &str = "failed to upgrade";

/// What a sync should do for an addon in its current phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Install on the target cluster inline
    Install,
    /// Start (or keep) the delayed reinstall task
    Reinit,
    /// Start (or keep) the availability polling task
    Check,
    /// Desired version differs from the deployed one; move to Upgrading
    BeginUpgrade,
    /// Start (or keep) the periodic health watch
    WatchHealth,
    /// Start (or keep) the image rollout task
    Upgrade,
    /// Terminal; clear background guards and stop
    Halt,
}

/// Decide the action for the given spec and status
pub fn plan(spec: &MeshAddonSpec, status: &MeshAddonStatus) -> Action {
    match status.effective_phase() {
        AddonPhase::Initializing => Action::Install,
        AddonPhase::Reinitializing => Action::Reinit,
        AddonPhase::Checking => Action::Check,
        AddonPhase::Running if spec.version != status.deployed_version => Action::BeginUpgrade,
        AddonPhase::Running => Action::WatchHealth,
        AddonPhase::Upgrading => Action::Upgrade,
        AddonPhase::Failed => Action::Halt,
    }
}

/// Time left before the next reinstall attempt.
///
/// A missing timestamp, or one older than `timeout`, yields the 1ns floor so
/// the attempt runs immediately.
pub fn reinit_delay(
    last_reinit: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Duration {
    let floor = Duration::from_nanos(1);
    let Some(last) = last_reinit else {
        return floor;
    };
    // A timestamp in the future counts as zero elapsed
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    timeout.saturating_sub(elapsed).max(floor)
}

fn enter(status: &mut MeshAddonStatus, phase: AddonPhase) {
    status.phase = Some(phase);
}

/// First install succeeded
pub fn install_succeeded(status: &mut MeshAddonStatus, version: &str) {
    enter(status, AddonPhase::Checking);
    status.retry_count = 0;
    status.reason.clear();
    status.deployed_version = version.to_string();
}

/// First install failed
pub fn install_failed(status: &mut MeshAddonStatus, reason: &str, now: DateTime<Utc>) {
    enter(status, AddonPhase::Reinitializing);
    status.retry_count = 1;
    status.reason = reason.to_string();
    status.last_reinit_timestamp = Some(now);
}

/// Reinstall succeeded
pub fn reinit_succeeded(status: &mut MeshAddonStatus, version: &str) {
    enter(status, AddonPhase::Checking);
    status.reason.clear();
    status.deployed_version = version.to_string();
}

/// Reinstall failed: count the attempt, or give up once the budget is spent
pub fn reinit_failed(status: &mut MeshAddonStatus, reason: &str, now: DateTime<Utc>) {
    if status.retry_count >= MAX_RETRY_COUNT {
        enter(status, AddonPhase::Failed);
        status.retry_count = MAX_RETRY_COUNT;
        status.reason = REASON_RETRIES_EXHAUSTED.to_string();
        return;
    }
    status.retry_count += 1;
    status.reason = reason.to_string();
    status.last_reinit_timestamp = Some(now);
}

/// Deployment became available while Checking
pub fn checking_healthy(status: &mut MeshAddonStatus) {
    enter(status, AddonPhase::Running);
    status.reason.clear();
}

/// Still unavailable after the Checking grace window; phase unchanged
pub fn checking_overdue(status: &mut MeshAddonStatus) {
    status.reason = REASON_UNHEALTHY_IN_CHECK.to_string();
}

/// Health watch found the deployment unavailable
pub fn watch_unhealthy(status: &mut MeshAddonStatus) {
    enter(status, AddonPhase::Checking);
    status.reason = REASON_UNHEALTHY_IN_WATCH.to_string();
}

/// Desired version drifted from the deployed version
pub fn begin_upgrade(status: &mut MeshAddonStatus) {
    enter(status, AddonPhase::Upgrading);
    status.retry_count = 0;
    status.reason.clear();
}

/// Image rollout applied
pub fn upgrade_succeeded(status: &mut MeshAddonStatus, version: &str) {
    enter(status, AddonPhase::Checking);
    status.reason.clear();
    status.deployed_version = version.to_string();
}

/// Image rollout kept failing until its deadline
pub fn upgrade_failed(status: &mut MeshAddonStatus) {
    enter(status, AddonPhase::Failed);
    status.reason = REASON_UPGRADE_FAILED.to_string();
}
