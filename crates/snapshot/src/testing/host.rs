//! Host collaborator fakes

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::host::{GuestBridge, HangDetector, HostEnvironment, MessageSeverity, WindowAgent};

/// Records every message instead of showing it
#[derive(Debug, Default)]
pub struct RecordingWindow {
    messages: Mutex<Vec<(String, MessageSeverity)>>,
}

impl RecordingWindow {
    /// Messages shown so far
    pub fn messages(&self) -> Vec<(String, MessageSeverity)> {
        self.messages.lock().clone()
    }

    /// Whether any message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|(m, _)| m.contains(needle))
    }

    /// Number of messages with `severity`
    pub fn count(&self, severity: MessageSeverity) -> usize {
        self.messages.lock().iter().filter(|(_, s)| *s == severity).count()
    }

    /// Forget recorded messages
    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl WindowAgent for RecordingWindow {
    fn show_message(&self, text: &str, severity: MessageSeverity, _timeout: Duration) {
        self.messages.lock().push((text.to_string(), severity));
    }
}

/// Counts pauses and resumes
#[derive(Debug, Default)]
pub struct RecordingHangDetector {
    depth: AtomicI64,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
}

impl RecordingHangDetector {
    /// More pauses than resumes so far
    pub fn is_paused(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    /// Number of `pause(true)` calls
    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    /// Number of `pause(false)` calls
    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl HangDetector for RecordingHangDetector {
    fn pause(&self, paused: bool) {
        if paused {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            self.depth.fetch_add(1, Ordering::SeqCst);
        } else {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Settable renderer and disk facts
#[derive(Debug)]
pub struct StaticEnvironment {
    renderer: Mutex<String>,
    supports_snapshots: AtomicBool,
    free_disk_bytes: Mutex<Option<u64>>,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        StaticEnvironment {
            renderer: Mutex::new("host".to_string()),
            supports_snapshots: AtomicBool::new(true),
            free_disk_bytes: Mutex::new(None),
        }
    }
}

impl StaticEnvironment {
    /// Change the renderer name
    pub fn set_renderer(&self, name: &str) {
        *self.renderer.lock() = name.to_string();
    }

    /// Change renderer snapshot support
    pub fn set_supports_snapshots(&self, supported: bool) {
        self.supports_snapshots.store(supported, Ordering::SeqCst);
    }

    /// Report `bytes` free, or unknown for `None`
    pub fn set_free_disk_bytes(&self, bytes: Option<u64>) {
        *self.free_disk_bytes.lock() = bytes;
    }
}

impl HostEnvironment for StaticEnvironment {
    fn renderer_name(&self) -> String {
        self.renderer.lock().clone()
    }

    fn renderer_supports_snapshots(&self) -> bool {
        self.supports_snapshots.load(Ordering::SeqCst)
    }

    fn free_disk_bytes(&self, _path: &Path) -> Option<u64> {
        *self.free_disk_bytes.lock()
    }
}

/// Guest bridge with settable state
#[derive(Debug, Default)]
pub struct FakeGuestBridge {
    boot_completed: AtomicBool,
    online: AtomicBool,
    reconnects: AtomicUsize,
}

impl FakeGuestBridge {
    /// A guest that finished booting and is online
    pub fn booted() -> Self {
        let bridge = FakeGuestBridge::default();
        bridge.set_boot_completed(true);
        bridge.set_online(true);
        bridge
    }

    /// Change the boot-completed flag
    pub fn set_boot_completed(&self, completed: bool) {
        self.boot_completed.store(completed, Ordering::SeqCst);
    }

    /// Change the online flag
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of `reconnect` calls
    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl GuestBridge for FakeGuestBridge {
    fn is_boot_completed(&self) -> bool {
        self.boot_completed.load(Ordering::SeqCst)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}
