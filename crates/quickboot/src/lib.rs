//! Quickboot policy for quicksnap
//!
//! Decides between cold boot and snapshot load on start, confirms a loaded
//! guest comes back online, and decides whether to save on exit:
//! - config: `quickboot.toml` settings
//! - choice: the persisted save-on-exit decision
//! - looper: single-threaded timer scheduling
//! - liveness: post-load liveness monitor
//! - quickboot: the load/save policy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod choice;
pub mod config;
pub mod liveness;
pub mod looper;
pub mod quickboot;

pub use choice::QuickbootChoice;
pub use config::{ConfigError, QuickbootConfig, CONFIG_FILE_NAME};
pub use liveness::{LivenessMonitor, LivenessOutcome, LivenessSettings, BOOT_COMPLETED_MARKER};
pub use looper::{ManualLooper, Scheduler, Task, ThreadLooper, TimerHandle};
pub use quickboot::{
    ColdBootSource, LoadFailureReport, Quickboot, QuickbootState, SaveOutcome, SaveSkipReason,
};
