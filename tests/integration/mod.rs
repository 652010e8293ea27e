//! End-to-end runs of the synchronizer against the in-memory remote
//!
//! Covers the basic ledger scenarios (new, current, stale, failed upload,
//! missing project) and the behaviour around them: idempotent re-runs,
//! failure isolation, multiple projects, the index backend, deep change
//! detection, parallel workers and project locks.

use crate::harness::*;
use filetime::{set_file_mtime, FileTime};
use parking_lot::Mutex;
use scansync::lock::ProjectLock;
use scansync::*;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[test]
fn test_new_archive_is_uploaded_and_marked() {
    let layout = Layout::new();
    let archive = layout.archive("P", "scan1.PvDatasets", 1_000_000);
    let client = RecordingClient::new();

    let before = SystemTime::now() - Duration::from_secs(1);
    let report = layout.synchronizer(&client).run().unwrap();
    let after = SystemTime::now() + Duration::from_secs(1);

    assert_eq!(client.imported(), vec!["scan1.PvDatasets"]);
    assert_eq!(client.sidecar_names(), vec!["scan1.PvDatasets"]);

    let outcome = &report.project("P").unwrap().outcomes[0];
    assert_eq!(outcome.classification, Classification::New);
    assert!(matches!(outcome.status, ArchiveStatus::Uploaded { .. }));

    let marker = layout.marker("P", "scan1.PvDatasets");
    assert_eq!(fs::read_link(&marker).unwrap(), archive);
    let watermark = layout.marker_mtime("P", "scan1.PvDatasets").unwrap();
    assert!(watermark >= before && watermark <= after);
}

#[test]
fn test_archive_older_than_marker_is_skipped() {
    let layout = Layout::new();
    let archive = layout.archive("P", "scan1.PvDatasets", 1_000);
    layout.mark("P", "scan1.PvDatasets", &archive, 2_000);
    let client = RecordingClient::new();

    let report = layout.synchronizer(&client).run().unwrap();

    assert_eq!(client.import_count(), 0);
    let outcome = &report.project("P").unwrap().outcomes[0];
    assert_eq!(outcome.classification, Classification::Current);
    assert_eq!(outcome.status, ArchiveStatus::Skipped);
    assert_eq!(layout.marker_mtime("P", "scan1.PvDatasets"), Some(at(2_000)));
}

#[test]
fn test_archive_equal_to_marker_is_current() {
    let layout = Layout::new();
    let archive = layout.archive("P", "scan1.PvDatasets", 2_000);
    layout.mark("P", "scan1.PvDatasets", &archive, 2_000);
    let client = RecordingClient::new();

    let report = layout.synchronizer(&client).run().unwrap();

    assert_eq!(client.import_count(), 0);
    assert_eq!(report.project("P").unwrap().count(Classification::Current), 1);
}

#[test]
fn test_changed_archive_is_reuploaded_and_marker_refreshed() {
    let layout = Layout::new();
    let archive = layout.archive("P", "scan1.PvDatasets", 2_001);
    layout.mark("P", "scan1.PvDatasets", &archive, 2_000);
    let client = RecordingClient::new();

    let report = layout.synchronizer(&client).run().unwrap();

    assert_eq!(client.import_count(), 1);
    assert_eq!(report.project("P").unwrap().count(Classification::Stale), 1);
    let watermark = layout.marker_mtime("P", "scan1.PvDatasets").unwrap();
    assert!(watermark >= at(2_001));
    assert_eq!(fs::read_link(layout.marker("P", "scan1.PvDatasets")).unwrap(), archive);
}

#[test]
fn test_future_dated_archive_gets_watermark_at_its_mtime() {
    let layout = Layout::new();
    let future = SystemTime::now() + Duration::from_secs(3_600);
    let secs = future.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs();
    layout.archive("P", "skewed.PvDatasets", secs);
    let client = RecordingClient::new();
    let sync = layout.synchronizer(&client);

    sync.run().unwrap();
    let watermark = layout.marker_mtime("P", "skewed.PvDatasets").unwrap();
    assert!(watermark >= at(secs));

    sync.run().unwrap();
    assert_eq!(client.import_count(), 1);
}

#[test]
fn test_failed_upload_leaves_archive_unmarked_and_run_continues() {
    let layout = Layout::new();
    layout.archive("P", "a.PvDatasets", 1_000);
    layout.archive("P", "b.PvDatasets", 1_000);
    let client = RecordingClient::new();
    client.reject("a.PvDatasets");
    let sync = layout.synchronizer(&client);

    let report = sync.run().unwrap();
    let project = report.project("P").unwrap();
    assert_eq!(project.failed(), 1);
    assert_eq!(project.uploaded(), 1);
    assert!(report.has_failures());
    assert!(layout.marker_mtime("P", "a.PvDatasets").is_none());
    assert!(layout.marker_mtime("P", "b.PvDatasets").is_some());

    let failed = project.outcomes.iter().find(|o| o.name == "a.PvDatasets").unwrap();
    match &failed.status {
        ArchiveStatus::Failed { status, reason } => {
            assert_eq!(*status, Some(500));
            assert!(reason.contains("cannot import"));
        }
        other => panic!("expected failure, got {:?}", other),
    }

    // Next run retries only the failed archive
    client.accept("a.PvDatasets");
    let report = sync.run().unwrap();
    let project = report.project("P").unwrap();
    assert_eq!(project.count(Classification::New), 1);
    assert_eq!(project.count(Classification::Current), 1);
    assert_eq!(client.imported(), vec!["b.PvDatasets", "a.PvDatasets"]);
    assert!(!report.has_failures());
}

#[test]
fn test_failed_reupload_keeps_old_watermark() {
    let layout = Layout::new();
    let archive = layout.archive("P", "scan1.PvDatasets", 5_000);
    layout.mark("P", "scan1.PvDatasets", &archive, 4_000);
    let client = RecordingClient::new();
    client.reject("scan1.PvDatasets");

    layout.synchronizer(&client).run().unwrap();

    assert_eq!(layout.marker_mtime("P", "scan1.PvDatasets"), Some(at(4_000)));
}

#[test]
fn test_missing_project_is_reported_and_others_continue() {
    let layout = Layout::new();
    layout.archive("P", "scan1.PvDatasets", 1_000);
    let client = RecordingClient::new();
    let sync = layout.synchronizer(&client);

    let report = sync.run_projects(&["ghost".to_string(), "P".to_string()]);

    let ghost = report.project("ghost").unwrap();
    assert!(ghost.error.as_deref().unwrap().contains("Cannot scan"));
    assert!(ghost.outcomes.is_empty());
    assert!(!layout.ledger_root.join("ghost").exists());
    assert_eq!(report.project("P").unwrap().uploaded(), 1);
}

#[test]
fn test_second_run_without_changes_uploads_nothing() {
    let layout = Layout::new();
    layout.archive("P", "a.PvDatasets", 1_000);
    layout.archive("P", "nested/deeper/b.PvDatasets", 2_000);
    layout.archive("Q", "c.PvDatasets", 3_000);
    let client = RecordingClient::new();
    let sync = layout.synchronizer(&client);

    let first = sync.run().unwrap();
    assert_eq!(first.total_uploaded(), 3);

    let second = sync.run().unwrap();
    assert_eq!(second.total_uploaded(), 0);
    assert!(second
        .projects
        .iter()
        .flat_map(|p| &p.outcomes)
        .all(|o| o.classification == Classification::Current));
    assert_eq!(client.import_count(), 3);
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn test_all_projects_processed_in_name_order() {
    let layout = Layout::new();
    layout.archive("zebra", "z.PvDatasets", 1_000);
    layout.archive("alpha", "a.PvDatasets", 1_000);
    layout.archive(".trash", "t.PvDatasets", 1_000);
    layout.project("empty");
    let client = RecordingClient::new();

    let report = layout.synchronizer(&client).run().unwrap();

    let names: Vec<&str> = report.projects.iter().map(|p| p.project.as_str()).collect();
    assert_eq!(names, vec!["alpha", "empty", "zebra"]);
    assert_eq!(client.imported(), vec!["a.PvDatasets", "z.PvDatasets"]);
    assert!(layout.ledger_root.join("empty").is_dir());
}

#[test]
fn test_only_matching_names_are_bundles() {
    let layout = Layout::new();
    layout.archive("P", "scan1.PvDatasets", 1_000);
    layout.archive("P", "notes.txt", 1_000);
    layout.archive("P", "scan1.PvDatasets.bak", 1_000);
    let client = RecordingClient::new();

    layout.synchronizer(&client).run().unwrap();

    assert_eq!(client.imported(), vec!["scan1.PvDatasets"]);
}

#[test]
fn test_index_backend_keeps_same_semantics() {
    let layout = Layout::new();
    layout.archive("P", "scan1.PvDatasets", 1_000);
    let client = RecordingClient::new();
    let mut config = layout.config();
    config.ledger_backend = LedgerBackend::Index;
    let sync = SynchronizerBuilder::new(config).build(client.clone()).unwrap();

    sync.run().unwrap();
    let index = layout.ledger_root.join("P").join(ledger::INDEX_FILE_NAME);
    assert!(index.is_file());
    assert!(layout.marker_mtime("P", "scan1.PvDatasets").is_none());

    sync.run().unwrap();
    assert_eq!(client.import_count(), 1);

    // A changed archive is picked up through the index as well
    set_file_mtime(
        layout.data_root.join("P/scan1.PvDatasets"),
        FileTime::from_system_time(SystemTime::now() + Duration::from_secs(60)),
    )
    .unwrap();
    let report = sync.run().unwrap();
    assert_eq!(report.project("P").unwrap().count(Classification::Stale), 1);
    assert_eq!(client.import_count(), 2);
}

#[test]
fn test_deep_detection_sees_rewritten_content() {
    let layout = Layout::new();
    let bundle = layout.project("P").join("study.PvDatasets");
    fs::create_dir_all(&bundle).unwrap();
    let fid = bundle.join("fid");
    fs::write(&fid, b"v1").unwrap();
    set_file_mtime(&fid, FileTime::from_unix_time(1_000, 0)).unwrap();
    set_file_mtime(&bundle, FileTime::from_unix_time(1_000, 0)).unwrap();
    layout.mark("P", "study.PvDatasets", &bundle, 2_000);

    // Rewritten in place: the directory's own mtime does not move
    fs::write(&fid, b"v2").unwrap();
    set_file_mtime(&fid, FileTime::from_unix_time(3_000, 0)).unwrap();
    set_file_mtime(&bundle, FileTime::from_unix_time(1_000, 0)).unwrap();

    let client = RecordingClient::new();
    let shallow = layout.synchronizer(&client).run().unwrap();
    assert_eq!(shallow.project("P").unwrap().count(Classification::Current), 1);
    assert_eq!(client.import_count(), 0);

    let deep = SynchronizerBuilder::new(layout.config())
        .change_detection(ChangeDetection::Deep)
        .build(client.clone())
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(deep.project("P").unwrap().count(Classification::Stale), 1);
    assert_eq!(client.sidecar_names(), vec!["study.PvDatasets.tar.gz"]);
}

#[test]
fn test_parallel_workers_upload_every_archive_once() {
    let layout = Layout::new();
    for i in 0..12 {
        layout.archive("P", &format!("scan{i:02}.PvDatasets"), 1_000 + i);
    }
    let client = RecordingClient::new();
    let sync = SynchronizerBuilder::new(layout.config())
        .workers(4)
        .build(client.clone())
        .unwrap();

    let report = sync.run().unwrap();
    let project = report.project("P").unwrap();
    assert_eq!(project.uploaded(), 12);

    let mut imported = client.imported();
    imported.sort();
    imported.dedup();
    assert_eq!(imported.len(), 12);
    for i in 0..12 {
        assert!(layout.marker_mtime("P", &format!("scan{i:02}.PvDatasets")).is_some());
    }

    let state = client.state.lock();
    assert_eq!(state.sessions_opened, state.sessions_closed);
}

#[test]
fn test_locked_project_is_skipped() {
    let layout = Layout::new();
    layout.archive("P", "a.PvDatasets", 1_000);
    layout.archive("Q", "b.PvDatasets", 1_000);
    let client = RecordingClient::new();
    let sync = layout.synchronizer(&client);

    let _held = ProjectLock::acquire(&layout.ledger_root, "P").unwrap();
    let report = sync.run().unwrap();

    assert!(report.project("P").unwrap().error.as_deref().unwrap().contains("held"));
    assert_eq!(report.project("Q").unwrap().uploaded(), 1);
    assert_eq!(client.imported(), vec!["b.PvDatasets"]);
}

#[test]
fn test_existing_sidecar_resource_is_reused() {
    let layout = Layout::new();
    layout.archive("P", "scan1.PvDatasets", 1_000);
    let client = RecordingClient::new();
    client
        .state
        .lock()
        .resources
        .entry("/data/projects/P/experiments/scan1.PvDatasets".to_string())
        .or_default()
        .insert("PvDatasets".to_string());

    let report = layout.synchronizer(&client).run().unwrap();

    assert!(!report.has_failures());
    assert_eq!(client.sidecar_names(), vec!["scan1.PvDatasets"]);
}

#[test]
fn test_report_serialises_to_json() {
    let layout = Layout::new();
    layout.archive("P", "scan1.PvDatasets", 1_000);
    let client = RecordingClient::new();

    let report = layout.synchronizer(&client).run().unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["projects"][0]["project"], "P");
    assert_eq!(json["projects"][0]["outcomes"][0]["classification"], "new");
    assert_eq!(json["projects"][0]["outcomes"][0]["status"]["state"], "uploaded");
    assert_eq!(json["dry_run"], false);
}

#[cfg(unix)]
#[test]
fn test_unreadable_bundle_is_reported_as_failure() {
    let layout = Layout::new();
    layout.archive("P", "ok.PvDatasets", 1_000);
    let lost = layout.project("P").join("lost.PvDatasets");
    std::os::unix::fs::symlink(layout.temp_dir.path().join("nowhere"), &lost).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let client = RecordingClient::new();
    let report = SynchronizerBuilder::new(layout.config())
        .on_event(move |event| sink.lock().push(event.clone()))
        .build(client.clone())
        .unwrap()
        .run()
        .unwrap();

    assert!(report.has_failures());
    let project = report.project("P").unwrap();
    let names: Vec<&str> = project.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["lost.PvDatasets", "ok.PvDatasets"]);

    let outcome = &project.outcomes[0];
    assert!(outcome.is_failure());
    assert_eq!(outcome.path, lost);
    assert_eq!(outcome.archive_mtime, None);
    assert!(events.lock().iter().any(|e| matches!(
        e,
        SyncEvent::Failed { archive, .. } if archive == "lost.PvDatasets"
    )));

    // The readable archive still went through, and nothing was marked for the lost one
    assert_eq!(client.import_count(), 1);
    assert!(layout.marker_mtime("P", "lost.PvDatasets").is_none());
}

#[cfg(test)]
mod logging {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_failed_upload_is_logged_with_reason() {
        let layout = Layout::new();
        layout.archive("P", "good.PvDatasets", 1_000);
        layout.archive("P", "bad.PvDatasets", 1_000);
        let client = RecordingClient::new();
        client.reject("bad.PvDatasets");

        let report = layout.synchronizer(&client).run().unwrap();

        assert_eq!(report.total_failed(), 1);
        assert!(logs_contain("Failed to upload bad.PvDatasets"));
        assert!(logs_contain("Uploaded good.PvDatasets"));
        assert!(!logs_contain("Failed to upload good.PvDatasets"));
    }

    #[test]
    #[traced_test]
    fn test_status_run_logs_planned_uploads() {
        let layout = Layout::new();
        layout.archive("P", "scan1.PvDatasets", 1_000);
        let client = RecordingClient::new();

        let report = SynchronizerBuilder::new(layout.config())
            .dry_run(true)
            .build(client.clone())
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.project("P").unwrap().outcomes[0].status, ArchiveStatus::Planned);
        assert_eq!(client.import_count(), 0);
        assert!(!layout.ledger_root.exists());
        assert!(logs_contain("scan1.PvDatasets would be uploaded (new)"));
    }
}
