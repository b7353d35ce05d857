//! Process lifecycle through the facade: open, install, quickboot, exit

use std::sync::Arc;
use std::time::Duration;

use quicksnap::testing::FakeHost;
use quicksnap::{
    ContextError, LivenessOutcome, ManualLooper, QuickbootState, SnapshotContext, SnapshotPaths,
    DEFAULT_BOOT_SNAPSHOT,
};
use tempfile::TempDir;

#[test]
fn test_two_sessions_through_global_context() {
    let dir = TempDir::new().unwrap();
    let paths = SnapshotPaths::from_base(dir.path());
    let host = FakeHost::new(&paths);
    let looper = Arc::new(ManualLooper::new());

    // First session: nothing to load, run, save on exit.
    let context =
        SnapshotContext::open(dir.path(), host.collaborators(), looper.clone()).unwrap();
    let context = quicksnap::initialize(context).unwrap();
    let again = SnapshotContext::open(dir.path(), host.collaborators(), looper.clone()).unwrap();
    assert!(matches!(
        quicksnap::initialize(again),
        Err(ContextError::AlreadyInitialized)
    ));

    let installed = quicksnap::get().unwrap();
    assert_eq!(installed.quickboot().load(""), QuickbootState::LoadFailed);
    host.vm.write_ram("pc.ram", 3 * quicksnap::PAGE_SIZE, b"session one");
    looper.advance(Duration::from_secs(20));
    assert!(installed.quickboot().save_on_exit("").is_saved());
    drop(installed);
    drop(context);
    assert!(quicksnap::finalize().is_some());
    assert!(quicksnap::get().is_none());

    // Second session: quickboot restores RAM and the guest comes online.
    host.vm.fill_ram(0);
    let context = quicksnap::initialize(
        SnapshotContext::open(dir.path(), host.collaborators(), looper.clone()).unwrap(),
    )
    .unwrap();
    assert_eq!(context.quickboot().load(""), QuickbootState::Loaded);
    assert_eq!(
        host.vm.read_ram("pc.ram", 3 * quicksnap::PAGE_SIZE, 11),
        b"session one"
    );
    assert_eq!(
        context.snapshotter().loaded_snapshot().as_deref(),
        Some(DEFAULT_BOOT_SNAPSHOT)
    );
    looper.advance(Duration::from_millis(100));
    assert_eq!(
        context.quickboot().liveness().outcome(),
        LivenessOutcome::Alive
    );
    assert!(host.window.messages().is_empty());
    assert_eq!(host.hang_detector.pause_count(), host.hang_detector.resume_count());

    drop(context);
    quicksnap::finalize();
}
