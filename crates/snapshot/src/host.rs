//! Host-side collaborators
//!
//! The snapshot core never presents UI, watches for hangs or talks to the
//! guest itself. It reaches those services through the traits here:
//!
//! - [`HangDetector`]: watchdog paused around long snapshot I/O
//! - [`WindowAgent`]: user-visible messages
//! - [`HostEnvironment`]: renderer capabilities and free disk space
//! - [`GuestBridge`]: guest boot/online state and reconnects
//!
//! [`Collaborators`] bundles them together with the VM operations.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::vm::VmOperations;

/// How long messages stay on screen unless a caller says otherwise
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Watchdog that flags the VM as unresponsive
pub trait HangDetector: Send + Sync {
    /// Pause (`true`) or resume (`false`) hang detection
    fn pause(&self, paused: bool);
}

/// Resumes hang detection when dropped
///
/// Created right after pausing so every exit path, panics included,
/// resumes the detector.
pub struct HangResumeGuard<'a> {
    detector: &'a dyn HangDetector,
}

impl<'a> HangResumeGuard<'a> {
    /// Guard an already paused detector
    pub fn new(detector: &'a dyn HangDetector) -> Self {
        HangResumeGuard { detector }
    }
}

impl Drop for HangResumeGuard<'_> {
    fn drop(&mut self) {
        self.detector.pause(false);
    }
}

/// Message severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSeverity {
    /// Informational
    Info,
    /// Something degraded but the session continues
    Warning,
    /// An operation failed
    Error,
}

impl fmt::Display for MessageSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSeverity::Info => write!(f, "info"),
            MessageSeverity::Warning => write!(f, "warning"),
            MessageSeverity::Error => write!(f, "error"),
        }
    }
}

/// UI surface for user-visible messages
pub trait WindowAgent: Send + Sync {
    /// Show `text` for `timeout`
    fn show_message(&self, text: &str, severity: MessageSeverity, timeout: Duration);
}

/// Facts about the host the VM runs on
pub trait HostEnvironment: Send + Sync {
    /// Name of the active rendering backend
    fn renderer_name(&self) -> String;

    /// Whether the active renderer can save and restore its state
    fn renderer_supports_snapshots(&self) -> bool;

    /// Free bytes on the filesystem holding `path`, if known
    fn free_disk_bytes(&self, path: &Path) -> Option<u64>;
}

/// Connection to the agent running inside the guest
pub trait GuestBridge: Send + Sync {
    /// Guest reported that it finished booting
    fn is_boot_completed(&self) -> bool;

    /// Guest agent is connected
    fn is_online(&self) -> bool;

    /// Drop and re-establish the guest connection
    fn reconnect(&self);
}

/// Every external service the snapshot core calls into
#[derive(Clone)]
pub struct Collaborators {
    /// VM control
    pub vm: Arc<dyn VmOperations>,
    /// Messages
    pub window: Arc<dyn WindowAgent>,
    /// Watchdog
    pub hang_detector: Arc<dyn HangDetector>,
    /// Renderer and disk facts
    pub environment: Arc<dyn HostEnvironment>,
    /// Guest connection
    pub guest: Arc<dyn GuestBridge>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Guest booted and its agent is reachable
    pub fn is_guest_alive(&self) -> bool {
        self.guest.is_boot_completed() && self.guest.is_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Counting(AtomicI32);

    impl HangDetector for Counting {
        fn pause(&self, paused: bool) {
            let delta = if paused { 1 } else { -1 };
            self.0.fetch_add(delta, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_resume_guard_runs_on_panic() {
        let detector = Counting(AtomicI32::new(0));
        detector.pause(true);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = HangResumeGuard::new(&detector);
            panic!("completion failed");
        }));
        assert!(result.is_err());
        assert_eq!(detector.0.load(Ordering::SeqCst), 0);
    }
}
