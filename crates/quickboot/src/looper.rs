//! Single-threaded timer scheduling
//!
//! Quickboot and the liveness monitor run as timer callbacks on one loop.
//! [`Scheduler`] is that loop: schedule a task after a delay, get a
//! [`TimerHandle`] that cancels it before it fires.
//!
//! - [`ThreadLooper`] runs tasks on a dedicated `quicksnap-looper` thread
//! - [`ManualLooper`] runs them only when a test advances virtual time

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

/// Work run by a scheduler
pub type Task = Box<dyn FnOnce() + Send>;

/// A loop that runs delayed tasks one at a time
pub trait Scheduler: Send + Sync {
    /// Time since the loop was created
    fn now(&self) -> Duration;

    /// Run `task` once `delay` has passed
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Cancels a scheduled task
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    canceled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Keep the task from running; no effect once it ran
    pub fn cancel(&self) {
        self.canceled.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether `cancel` was called
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(AtomicOrdering::SeqCst)
    }
}

struct TimerEntry {
    deadline: Duration,
    sequence: u64,
    handle: TimerHandle,
    task: Task,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

// Earliest deadline first, then older sequence first
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ============================================================================
// ManualLooper
// ============================================================================

struct ManualState {
    now: Duration,
    timers: BinaryHeap<TimerEntry>,
}

/// Deterministic loop driven by virtual time
///
/// Nothing runs until [`ManualLooper::advance`]; tasks run on the calling
/// thread in deadline order, with `now()` equal to their deadline.
pub struct ManualLooper {
    state: Mutex<ManualState>,
    sequence: AtomicU64,
}

impl Default for ManualLooper {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualLooper {
    /// A loop at virtual time zero
    pub fn new() -> Self {
        ManualLooper {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                timers: BinaryHeap::new(),
            }),
            sequence: AtomicU64::new(0),
        }
    }

    /// Move time forward by `by`, running every task that comes due
    ///
    /// Tasks scheduled by running tasks also run if they come due in the
    /// window. Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut ran = 0;
        loop {
            let entry = {
                let mut state = self.state.lock();
                match state.timers.peek() {
                    Some(next) if next.deadline <= target => {
                        let entry = state.timers.pop();
                        if let Some(entry) = entry.as_ref() {
                            state.now = state.now.max(entry.deadline);
                        }
                        entry
                    }
                    _ => {
                        state.now = target;
                        None
                    }
                }
            };
            let Some(entry) = entry else {
                return ran;
            };
            if entry.handle.is_canceled() {
                continue;
            }
            (entry.task)();
            ran += 1;
        }
    }

    /// Number of scheduled, uncanceled tasks
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|t| !t.handle.is_canceled())
            .count()
    }
}

impl Scheduler for ManualLooper {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::default();
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        state.timers.push(TimerEntry {
            deadline,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            handle: handle.clone(),
            task,
        });
        handle
    }
}

// ============================================================================
// ThreadLooper
// ============================================================================

struct LooperShared {
    epoch: Instant,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
}

impl LooperShared {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Loop running tasks on its own thread
///
/// Dropping the looper stops the thread; tasks not yet due are discarded.
pub struct ThreadLooper {
    shared: Arc<LooperShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadLooper {
    /// Start the `quicksnap-looper` thread
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(LooperShared {
            epoch: Instant::now(),
            timers: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("quicksnap-looper".to_string())
            .spawn(move || looper_loop(&worker))?;
        Ok(ThreadLooper {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop the thread and wait for it
    ///
    /// A task already running finishes first. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        {
            let _timers = self.shared.timers.lock();
            self.shared.wakeup.notify_all();
        }
        if let Some(thread) = self.thread.lock().take() {
            // Dropped from one of its own tasks: the thread exits on its own.
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!(target: "quicksnap::quickboot", "looper thread panicked");
            }
        }
    }
}

impl Scheduler for ThreadLooper {
    fn now(&self) -> Duration {
        self.shared.now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::default();
        let deadline = self.shared.now() + delay;
        let mut timers = self.shared.timers.lock();
        timers.push(TimerEntry {
            deadline,
            sequence: self.shared.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            handle: handle.clone(),
            task,
        });
        self.shared.wakeup.notify_one();
        handle
    }
}

impl Drop for ThreadLooper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn looper_loop(shared: &LooperShared) {
    debug!(target: "quicksnap::quickboot", "looper started");
    loop {
        let entry = {
            let mut timers = shared.timers.lock();
            loop {
                if shared.shutdown.load(AtomicOrdering::SeqCst) {
                    debug!(target: "quicksnap::quickboot", "looper stopped");
                    return;
                }
                let now = shared.now();
                match timers.peek().map(|t| t.deadline) {
                    Some(deadline) if deadline <= now => break timers.pop(),
                    Some(deadline) => {
                        shared.wakeup.wait_for(&mut timers, deadline - now);
                    }
                    None => shared.wakeup.wait(&mut timers),
                }
            }
        };
        let Some(entry) = entry else {
            continue;
        };
        if entry.handle.is_canceled() {
            continue;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry.task));
        if result.is_err() {
            error!(target: "quicksnap::quickboot", "looper task panicked");
        }
    }
}
