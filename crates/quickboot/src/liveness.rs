//! Post-load liveness monitor
//!
//! After a quickboot load the guest must come back online. The monitor polls
//! the guest bridge on the quickboot loop and escalates when the boot
//! timeout passes:
//!
//! 1. first timeout: tell the user and keep waiting
//! 2. later timeouts: reconnect the guest bridge and restart the timeout,
//!    up to `max_reconnects` times
//! 3. after that: show an error, delete the snapshot, stop polling
//!
//! The VM is never reset here; the hang detector covers a VM that is truly
//! stuck, and the deleted snapshot keeps the next start from retrying it.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use quicksnap_core::FailureReason;
use quicksnap_snapshot::{MessageSeverity, Snapshotter, DEFAULT_MESSAGE_TIMEOUT};
use tracing::{debug, info, warn};

use crate::config::QuickbootConfig;
use crate::looper::{Scheduler, TimerHandle};

/// Marker touched in the base directory when a loaded guest comes online
pub const BOOT_COMPLETED_MARKER: &str = "boot-completed";

/// Timing and budget for one monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessSettings {
    /// Time between polls
    pub interval: Duration,
    /// Time the guest gets before each escalation step
    pub boot_timeout: Duration,
    /// Reconnects before giving up
    pub max_reconnects: u32,
    /// File touched once the guest is online
    pub boot_marker: Option<PathBuf>,
}

impl LivenessSettings {
    /// Settings from a quickboot configuration
    pub fn from_config(config: &QuickbootConfig, boot_marker: Option<PathBuf>) -> Self {
        LivenessSettings {
            interval: config.liveness_interval(),
            boot_timeout: config.boot_timeout(),
            max_reconnects: config.max_adb_retries,
            boot_marker: boot_marker.filter(|_| config.write_boot_marker),
        }
    }
}

/// Where a monitor stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    /// Never started
    Idle,
    /// Polling
    Monitoring,
    /// Guest came online
    Alive,
    /// Retries exhausted; the snapshot was deleted
    GaveUp,
    /// Stopped by its owner
    Stopped,
}

struct MonitorState {
    outcome: LivenessOutcome,
    snapshot_name: String,
    loaded_at: Duration,
    baseline: Duration,
    informed: bool,
    reconnects: u32,
    ticks: u32,
    timer: Option<TimerHandle>,
}

struct MonitorShared {
    scheduler: Arc<dyn Scheduler>,
    snapshotter: Arc<Snapshotter>,
    settings: LivenessSettings,
    state: Mutex<MonitorState>,
}

enum Step {
    Online(Duration),
    Wait,
    Inform(Duration),
    Reconnect(Duration),
    GiveUp(Duration, String),
}

/// Polls a loaded guest until it is online or the budget runs out
pub struct LivenessMonitor {
    shared: Arc<MonitorShared>,
}

impl LivenessMonitor {
    /// A monitor that does nothing until [`LivenessMonitor::start`]
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        snapshotter: Arc<Snapshotter>,
        settings: LivenessSettings,
    ) -> Self {
        LivenessMonitor {
            shared: Arc::new(MonitorShared {
                scheduler,
                snapshotter,
                settings,
                state: Mutex::new(MonitorState {
                    outcome: LivenessOutcome::Idle,
                    snapshot_name: String::new(),
                    loaded_at: Duration::ZERO,
                    baseline: Duration::ZERO,
                    informed: false,
                    reconnects: 0,
                    ticks: 0,
                    timer: None,
                }),
            }),
        }
    }

    /// Start polling for the guest of snapshot `name`, loaded at `loaded_at`
    ///
    /// Restarting resets the retry budget.
    pub fn start(&self, name: &str, loaded_at: Duration) {
        {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.outcome = LivenessOutcome::Monitoring;
            state.snapshot_name = name.to_string();
            state.loaded_at = loaded_at;
            state.baseline = loaded_at;
            state.informed = false;
            state.reconnects = 0;
            state.ticks = 0;
        }
        debug!(target: "quicksnap::liveness", name, "liveness monitor started");
        MonitorShared::arm(&self.shared);
    }

    /// Stop polling; no effect unless monitoring
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        if state.outcome == LivenessOutcome::Monitoring {
            state.outcome = LivenessOutcome::Stopped;
        }
    }

    /// Current outcome
    pub fn outcome(&self) -> LivenessOutcome {
        self.shared.state.lock().outcome
    }

    /// Whether polling continues
    pub fn is_monitoring(&self) -> bool {
        self.outcome() == LivenessOutcome::Monitoring
    }

    /// Reconnects made since the last start
    pub fn reconnect_count(&self) -> u32 {
        self.shared.state.lock().reconnects
    }

    /// Polls run since the last start
    pub fn tick_count(&self) -> u32 {
        self.shared.state.lock().ticks
    }

    /// Settings in use
    pub fn settings(&self) -> &LivenessSettings {
        &self.shared.settings
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MonitorShared {
    fn arm(this: &Arc<Self>) {
        let weak: Weak<MonitorShared> = Arc::downgrade(this);
        let handle = this.scheduler.schedule(
            this.settings.interval,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    MonitorShared::tick(&shared);
                }
            }),
        );
        let mut state = this.state.lock();
        if state.outcome == LivenessOutcome::Monitoring {
            state.timer = Some(handle);
        } else {
            handle.cancel();
        }
    }

    fn tick(this: &Arc<Self>) {
        let now = this.scheduler.now();
        let step = this.decide(now);
        let collaborators = this.snapshotter.collaborators();

        match step {
            Step::Online(since_load) => {
                info!(target: "quicksnap::liveness",
                    seconds = since_load.as_secs_f64(),
                    "guest came online after loading");
                if let Some(marker) = this.settings.boot_marker.as_ref() {
                    if let Err(e) = fs::write(marker, b"") {
                        warn!(target: "quicksnap::liveness", path = %marker.display(),
                            error = %e, "cannot write boot marker");
                    }
                }
                return;
            }
            Step::Wait => {}
            Step::Inform(waited) => {
                collaborators.window.show_message(
                    &format!(
                        "Guest isn't online after {} seconds, loading remaining RAM pages",
                        waited.as_secs()
                    ),
                    MessageSeverity::Info,
                    DEFAULT_MESSAGE_TIMEOUT,
                );
            }
            Step::Reconnect(waited) => {
                collaborators.window.show_message(
                    &format!(
                        "Guest isn't online after {} seconds, retrying ADB connection",
                        waited.as_secs()
                    ),
                    MessageSeverity::Info,
                    DEFAULT_MESSAGE_TIMEOUT,
                );
                collaborators.guest.reconnect();
            }
            Step::GiveUp(waited, name) => {
                collaborators.window.show_message(
                    &format!(
                        "Guest isn't online after {} seconds; ADB cannot connect or snapshot \
                         corrupted. Deleting quickboot snapshot",
                        waited.as_secs()
                    ),
                    MessageSeverity::Error,
                    DEFAULT_MESSAGE_TIMEOUT,
                );
                warn!(target: "quicksnap::liveness", name = %name,
                    failure_reason = FailureReason::AdbOffline.code(),
                    "guest never came online, deleting snapshot");
                this.snapshotter.delete_snapshot(&name);
                return;
            }
        }
        Self::arm(this);
    }

    /// Advance the state for one poll at `now`
    fn decide(&self, now: Duration) -> Step {
        let alive = self.snapshotter.is_snapshot_alive();
        let mut state = self.state.lock();
        if state.outcome != LivenessOutcome::Monitoring {
            return Step::Wait;
        }
        state.timer = None;
        state.ticks += 1;

        if alive {
            state.outcome = LivenessOutcome::Alive;
            return Step::Online(now.saturating_sub(state.loaded_at));
        }
        let waited = now.saturating_sub(state.baseline);
        if waited <= self.settings.boot_timeout {
            return Step::Wait;
        }
        if !state.informed {
            state.informed = true;
            return Step::Inform(waited);
        }
        if state.reconnects < self.settings.max_reconnects {
            state.reconnects += 1;
            state.baseline = now;
            info!(target: "quicksnap::liveness", attempt = state.reconnects,
                max = self.settings.max_reconnects, "reconnecting guest bridge");
            return Step::Reconnect(waited);
        }
        state.outcome = LivenessOutcome::GaveUp;
        Step::GiveUp(waited, state.snapshot_name.clone())
    }
}
