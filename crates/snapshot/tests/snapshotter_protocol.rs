//! Snapshotter protocol tests
//!
//! These tests run the full save/load/delete callback protocol through the
//! in-process fakes:
//! - RAM round trips through save and load
//! - Saver and loader are never in progress together
//! - Completions without a matching operation are fatal
//! - Generic save/load clean up after failures
//! - Invalidation leaves a tombstone

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quicksnap_core::{FailureReason, OperationStage, OperationStatus, SnapshotOperation, PAGE_SIZE};
use quicksnap_snapshot::testing::FakeHost;
use quicksnap_snapshot::{
    MessageSeverity, Snapshot, SnapshotMetadata, SnapshotPaths, Snapshotter, SnapshotterState,
    VmConfiguration,
};
use tempfile::TempDir;

fn setup() -> (TempDir, FakeHost, Snapshotter) {
    let temp_dir = TempDir::new().unwrap();
    let paths = SnapshotPaths::from_base(temp_dir.path());
    paths.create_directories().unwrap();
    let host = FakeHost::new(&paths);
    let snapshotter = Snapshotter::new(paths, host.collaborators());
    (temp_dir, host, snapshotter)
}

fn write_pattern(host: &FakeHost) {
    host.vm.write_ram("pc.ram", 0, b"first page");
    host.vm.write_ram("pc.ram", 5 * PAGE_SIZE + 100, &[0x5a; 64]);
    host.vm.write_ram("pc.ram", 16 * PAGE_SIZE - 1, &[1]);
}

#[test]
fn test_save_then_load_restores_ram() {
    let (_dir, host, snapshotter) = setup();
    write_pattern(&host);
    let original = host.vm.read_ram("pc.ram", 0, 16 * PAGE_SIZE);

    assert_eq!(snapshotter.save(false, "a"), OperationStatus::Ok);
    assert_eq!(snapshotter.state(), SnapshotterState::Idle);
    let stats = snapshotter.save_stats().unwrap();
    assert_eq!(stats.written_pages, 3);
    assert_eq!(stats.zero_pages, 13);

    host.vm.fill_ram(0xaa);
    assert_eq!(snapshotter.prepare_for_loading("a"), OperationStatus::NotStarted);
    assert_eq!(snapshotter.state(), SnapshotterState::LoadingPrepared);
    assert_eq!(snapshotter.load(false, "a"), OperationStatus::Ok);

    assert_eq!(host.vm.read_ram("pc.ram", 0, 16 * PAGE_SIZE), original);
    assert_eq!(snapshotter.loaded_snapshot().as_deref(), Some("a"));
    assert!(snapshotter.last_load_duration().is_some());
    assert!(snapshotter.last_save_duration().is_some());
    assert_eq!(host.hang_detector.pause_count(), 2);
    assert!(!host.hang_detector.is_paused());
}

#[test]
fn test_successful_load_is_counted() {
    let (dir, _host, snapshotter) = setup();
    snapshotter.save(false, "a");
    snapshotter.load(false, "a");
    snapshotter.load(false, "a");

    let paths = SnapshotPaths::from_base(dir.path());
    let meta = SnapshotMetadata::read_from(&paths.metadata_file("a").unwrap()).unwrap();
    assert_eq!(meta.successful_loads, 2);
    assert_eq!(meta.invalid_loads, 0);
}

#[test]
fn test_report_invalid_load_counts_against_current_loader() {
    let (dir, host, snapshotter) = setup();
    snapshotter.save(false, "a");
    host.vm.fail_next_load();
    assert_eq!(snapshotter.load(false, "a"), OperationStatus::Error);

    let paths = SnapshotPaths::from_base(dir.path());
    let metadata_path = paths.metadata_file("a").unwrap();
    assert_eq!(SnapshotMetadata::read_from(&metadata_path).unwrap().invalid_loads, 0);

    assert!(!snapshotter.report_invalid_load("b"));
    assert!(snapshotter.report_invalid_load("a"));
    assert_eq!(SnapshotMetadata::read_from(&metadata_path).unwrap().invalid_loads, 1);
}

#[test]
fn test_save_records_loaded_snapshot_as_parent() {
    let (dir, _host, snapshotter) = setup();
    snapshotter.save(false, "base");
    snapshotter.load(false, "base");
    assert_eq!(snapshotter.save(false, "child"), OperationStatus::Ok);

    let paths = SnapshotPaths::from_base(dir.path());
    let meta = SnapshotMetadata::read_from(&paths.metadata_file("child").unwrap()).unwrap();
    assert_eq!(meta.parent.as_deref(), Some("base"));
}

#[test]
fn test_save_on_exit_notifies_vm() {
    let (_dir, host, snapshotter) = setup();
    assert_eq!(snapshotter.save(true, "a"), OperationStatus::Ok);
    assert_eq!(host.vm.exit_count(), 1);
    assert!(snapshotter.is_on_exit());
}

#[test]
fn test_prepare_for_saving_discards_loader() {
    let (_dir, host, snapshotter) = setup();
    snapshotter.save(false, "foo");

    assert_eq!(snapshotter.prepare_for_loading("foo"), OperationStatus::NotStarted);
    assert!(snapshotter.is_loading_in_progress());

    snapshotter.prepare_for_saving("foo");
    assert!(!snapshotter.has_loader());
    assert!(snapshotter.is_saving_in_progress());
    assert_eq!(snapshotter.state(), SnapshotterState::SavingPrepared);
    assert_eq!(host.vm.stop_count(), 1);
    assert_eq!(host.vm.start_count(), 1);
    snapshotter.cancel_save();
}

#[test]
#[should_panic(expected = "no such load is active")]
fn test_load_completion_after_save_prepared_is_fatal() {
    let (_dir, _host, snapshotter) = setup();
    snapshotter.save(false, "foo");
    snapshotter.prepare_for_loading("foo");
    snapshotter.prepare_for_saving("foo");
    snapshotter.on_loading_complete("foo", 0);
}

#[test]
fn test_protocol_violation_still_resumes_hang_detection() {
    let (_dir, host, snapshotter) = setup();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        snapshotter.on_saving_complete("missing", 0);
    }));
    assert!(result.is_err());
    assert_eq!(host.hang_detector.resume_count(), 1);
}

#[test]
fn test_saver_and_loader_never_both_in_progress() {
    let (_dir, _host, snapshotter) = setup();
    snapshotter.save(false, "a");

    let steps: [(bool, &str); 8] = [
        (true, "a"),
        (false, "a"),
        (false, "b"),
        (true, "b"),
        (true, "a"),
        (false, "a"),
        (false, "a"),
        (true, "b"),
    ];
    for (loading, name) in steps {
        if loading {
            snapshotter.prepare_for_loading(name);
        } else {
            snapshotter.prepare_for_saving(name);
        }
        assert!(
            !(snapshotter.is_saving_in_progress() && snapshotter.is_loading_in_progress()),
            "both operations in progress after preparing {name}"
        );
    }
    snapshotter.cancel_save();
}

#[test]
fn test_load_of_missing_snapshot_quick_fails() {
    let (_dir, host, snapshotter) = setup();
    assert_eq!(snapshotter.load(false, "nope"), OperationStatus::Error);
    assert_eq!(
        snapshotter.loader_failure_reason(),
        Some(FailureReason::NoSnapshotInImage)
    );
    assert_eq!(
        host.vm.failure_reasons(),
        vec![("nope".to_string(), FailureReason::NoSnapshotInImage)]
    );
    assert_eq!(snapshotter.loaded_snapshot(), None);
    assert_eq!(host.hang_detector.pause_count(), 0);
}

#[test]
fn test_validation_failure_continues_session() {
    let (dir, host, snapshotter) = setup();
    snapshotter.save(false, "a");
    host.vm.set_config(VmConfiguration {
        cpu_core_count: 2,
        ram_size_bytes: 16 * PAGE_SIZE as u64,
        hypervisor: "other".into(),
    });

    assert_eq!(snapshotter.load_generic("a"), OperationStatus::ErrorNotChanged);
    assert_eq!(
        snapshotter.loader_failure_reason(),
        Some(FailureReason::ConfigMismatchHostHypervisor)
    );
    assert!(host.window.contains("Continuing current session"));
    assert_eq!(host.vm.reset_count(), 0);
    assert!(dir.path().join("snapshots/a").exists());
    assert!(!host.hang_detector.is_paused());
}

#[test]
fn test_failed_load_after_mutation_resets_vm() {
    let (dir, host, snapshotter) = setup();
    snapshotter.save(false, "a");
    host.vm.fail_next_load();

    assert_eq!(snapshotter.load_generic("a"), OperationStatus::Error);
    assert!(host.window.contains("Fatal error, resetting current session"));
    assert_eq!(host.vm.reset_count(), 1);
    assert!(!dir.path().join("snapshots/a").exists());
    assert!(host
        .vm
        .failure_reasons()
        .contains(&("a".to_string(), FailureReason::EmulationEngineFailed)));
}

#[test]
fn test_generic_save_failure_cleans_out_snapshot() {
    let (dir, host, snapshotter) = setup();
    host.vm.fail_next_save();

    assert_eq!(snapshotter.save_generic("a"), OperationStatus::Error);
    assert!(host
        .window
        .contains("Snapshot save for snapshot 'a' failed. Cleaning it out"));
    assert!(!dir.path().join("snapshots/a").exists());
}

#[test]
fn test_check_safe_to_save_order() {
    let (_dir, host, snapshotter) = setup();

    host.guest.set_online(false);
    assert_eq!(snapshotter.check_safe_to_save("a"), Err(FailureReason::AdbOffline));
    host.guest.set_online(true);

    assert_eq!(snapshotter.check_safe_to_save("../a"), Err(FailureReason::NoSnapshotPb));

    host.environment.set_supports_snapshots(false);
    assert_eq!(
        snapshotter.check_safe_to_save("a"),
        Err(FailureReason::SnapshotsNotSupported)
    );
    host.environment.set_supports_snapshots(true);

    host.environment.set_free_disk_bytes(Some(1 << 30));
    assert_eq!(snapshotter.check_safe_to_save("a"), Err(FailureReason::OutOfDiskSpace));
    host.environment.set_free_disk_bytes(Some(10 << 30));

    host.vm.set_save_skipped(true);
    assert_eq!(
        snapshotter.check_safe_to_save("a"),
        Err(FailureReason::SnapshotsNotSupported)
    );
    host.vm.set_save_skipped(false);

    assert_eq!(snapshotter.check_safe_to_save("a"), Ok(()));
    assert_eq!(host.window.count(MessageSeverity::Error), 5);
}

#[test]
fn test_generic_save_skipped_when_guest_offline() {
    let (dir, host, snapshotter) = setup();
    host.guest.set_boot_completed(false);
    assert_eq!(snapshotter.save_generic("a"), OperationStatus::Error);
    assert!(host.window.contains("Emulator not booted"));
    assert!(!dir.path().join("snapshots/a").exists());
}

#[test]
fn test_invalidate_loaded_snapshot_leaves_tombstone() {
    let (dir, host, snapshotter) = setup();
    snapshotter.save(false, "a");
    snapshotter.load(false, "a");

    snapshotter.invalidate_snapshot("a");
    assert_eq!(snapshotter.loaded_snapshot(), None);
    assert!(!snapshotter.has_loader());
    assert!(!host.hang_detector.is_paused());

    let paths = SnapshotPaths::from_base(dir.path());
    assert!(paths.snapshot_dir("a").unwrap().exists());
    assert!(!paths.ram_file("a").unwrap().exists());
    assert!(!host.vm.device_state_path("a").unwrap().exists());

    let mut snapshot = Snapshot::new(&paths, "a").unwrap();
    assert!(!snapshot.preload());
    assert_eq!(snapshot.failure_reason(), Some(FailureReason::Tombstone));
    assert_eq!(snapshotter.prepare_for_loading("a"), OperationStatus::ErrorNotChanged);
}

#[test]
fn test_delete_snapshot_removes_directory() {
    let (dir, host, snapshotter) = setup();
    snapshotter.save(false, "a");
    snapshotter.save(false, "b");

    snapshotter.delete_snapshot("a");
    assert!(!dir.path().join("snapshots/a").exists());
    assert!(dir.path().join("snapshots/b").exists());
    assert_eq!(host.vm.delete_count(), 1);
    assert_eq!(snapshotter.state(), SnapshotterState::Idle);

    let paths = SnapshotPaths::from_base(dir.path());
    let names: Vec<_> = Snapshot::existing_snapshots(&paths)
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    assert_eq!(names, vec!["b"]);
}

#[test]
fn test_crash_shortly_after_load_invalidates_it() {
    let (_dir, _host, snapshotter) = setup();
    snapshotter.save(false, "a");
    snapshotter.load(false, "a");

    snapshotter.on_crashed_snapshot("a");
    assert_eq!(snapshotter.loader_status(), Some(OperationStatus::Error));
    assert_eq!(
        snapshotter.loader_failure_reason(),
        Some(FailureReason::CorruptedData)
    );
}

#[test]
fn test_crash_without_load_is_ignored() {
    let (_dir, host, snapshotter) = setup();
    snapshotter.on_crashed_snapshot("a");
    assert!(!snapshotter.has_loader());
    assert!(host.vm.failure_reasons().is_empty());
}

#[test]
fn test_canceled_save_fails() {
    let (_dir, _host, snapshotter) = setup();
    assert_eq!(snapshotter.prepare_for_saving("a"), OperationStatus::NotStarted);
    snapshotter.cancel_save();
    assert!(snapshotter.is_saving_canceled("a"));
    assert!(!snapshotter.is_saving_canceled("b"));

    assert_eq!(snapshotter.save(false, "a"), OperationStatus::Error);
    assert_eq!(snapshotter.saver_failure_reason(), Some(FailureReason::Canceled));
}

#[test]
fn test_operation_observers_see_every_stage() {
    let (_dir, _host, snapshotter) = setup();
    let starts = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    let loads = Arc::new(AtomicUsize::new(0));
    {
        let (starts, ends, loads) = (starts.clone(), ends.clone(), loads.clone());
        snapshotter.add_operation_callback(move |op, stage| {
            match stage {
                OperationStage::Start => starts.fetch_add(1, Ordering::SeqCst),
                OperationStage::End => ends.fetch_add(1, Ordering::SeqCst),
            };
            if op == SnapshotOperation::Load {
                loads.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    snapshotter.save(false, "a");
    snapshotter.load(false, "a");
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    assert_eq!(ends.load(Ordering::SeqCst), 2);
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_ram_file_settings() {
    let (dir, _host, snapshotter) = setup();
    assert!(!snapshotter.has_ram_file());
    snapshotter.set_ram_file(dir.path().join("guest.ram"), false);
    assert!(snapshotter.has_ram_file());
    assert!(!snapshotter.is_ram_file_shared());
    snapshotter.set_ram_file_shared(true);
    assert!(snapshotter.is_ram_file_shared());
    assert_eq!(snapshotter.ram_file(), Some(dir.path().join("guest.ram")));
}
