//! Main test module for scansync
//!
//! This module includes all test suites:
//! - Integration tests driving whole runs against an in-memory remote
//! - Property-based tests for the ledger invariants
//! - Edge cases around the on-disk ledger layout

pub mod harness;
pub mod integration;

#[cfg(test)]
mod edge_cases {
    use crate::harness::*;
    use ::scansync::*;
    use std::fs;

    #[cfg(unix)]
    #[test]
    fn test_dangling_marker_still_counts_as_uploaded() {
        let layout = Layout::new();
        let archive = layout.archive("P", "scan1.PvDatasets", 1_000);

        // Marker pointing somewhere that no longer exists
        let gone = layout.temp_dir.path().join("moved-away.PvDatasets");
        layout.mark("P", "scan1.PvDatasets", &gone, 2_000);
        assert!(fs::metadata(layout.marker("P", "scan1.PvDatasets")).is_err());

        let client = RecordingClient::new();
        let report = layout.synchronizer(&client).run().unwrap();

        assert_eq!(client.import_count(), 0);
        assert_eq!(report.project("P").unwrap().count(Classification::Current), 1);
        assert!(archive.exists());
    }

    #[test]
    fn test_plain_file_in_ledger_acts_as_marker() {
        let layout = Layout::new();
        layout.archive("P", "scan1.PvDatasets", 1_000);
        let marker = layout.marker("P", "scan1.PvDatasets");
        fs::create_dir_all(marker.parent().unwrap()).unwrap();
        fs::write(&marker, b"").unwrap();
        filetime::set_file_mtime(&marker, filetime::FileTime::from_unix_time(2_000, 0)).unwrap();

        let client = RecordingClient::new();
        layout.synchronizer(&client).run().unwrap();

        assert_eq!(client.import_count(), 0);
    }

    #[test]
    fn test_empty_project_creates_ledger_directory_only() {
        let layout = Layout::new();
        layout.project("P");

        let client = RecordingClient::new();
        let report = layout.synchronizer(&client).run().unwrap();

        assert!(report.project("P").unwrap().outcomes.is_empty());
        assert!(report.project("P").unwrap().is_clean());
        let entries: Vec<_> = fs::read_dir(layout.ledger_root.join("P")).unwrap().collect();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_directory_bundle_is_packed_for_transport() {
        let layout = Layout::new();
        let bundle = layout.project("P").join("study.PvDatasets");
        fs::create_dir_all(bundle.join("1/pdata/1")).unwrap();
        fs::write(bundle.join("1/pdata/1/2dseq"), b"pixels").unwrap();

        let client = RecordingClient::new();
        let report = layout.synchronizer(&client).run().unwrap();

        assert_eq!(report.project("P").unwrap().uploaded(), 1);
        assert_eq!(client.sidecar_names(), vec!["study.PvDatasets.tar.gz"]);
        // The bundle itself is untouched
        assert!(bundle.join("1/pdata/1/2dseq").is_file());
        assert_eq!(
            fs::read_link(layout.marker("P", "study.PvDatasets")).unwrap(),
            bundle
        );
    }
}
