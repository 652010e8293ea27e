//! Reconciliation of archives against the ledger
//!
//! The decision for one archive depends on exactly two inputs, the archive's
//! mtime and the watermark recorded for it:
//!
//! | watermark        | comparison            | verdict   |
//! |------------------|-----------------------|-----------|
//! | absent           | -                     | `New`     |
//! | present          | mtime > watermark     | `Stale`   |
//! | present          | mtime <= watermark    | `Current` |
//!
//! Equal timestamps are `Current`. Coarse filesystem timestamps routinely
//! make a freshly refreshed marker equal to its archive, and treating that as
//! stale would re-upload the archive on every run.

use crate::error::Result;
use crate::ledger::{Ledger, LedgerHandle};
use crate::types::{ArchiveBundle, Classification, Watermark};
use std::time::SystemTime;
use tracing::debug;

/// Classify an archive from its mtime and recorded watermark
pub fn classify(archive_mtime: SystemTime, watermark: Option<Watermark>) -> Classification {
    match watermark {
        None => Classification::New,
        Some(mark) if archive_mtime > mark => Classification::Stale,
        Some(_) => Classification::Current,
    }
}

/// Watermark to record after a successful upload
///
/// Normally the upload completion time. An archive stamped in the future
/// (clock skew on the acquisition host) gets its own mtime instead, so the
/// recorded watermark is never older than the archive it covers.
pub fn next_watermark(now: SystemTime, archive_mtime: SystemTime) -> Watermark {
    now.max(archive_mtime)
}

/// An archive together with its reconciliation verdict
#[derive(Debug, Clone)]
pub struct PlannedArchive {
    /// The archive found on disk
    pub bundle: ArchiveBundle,
    /// Watermark found in the ledger
    pub watermark: Option<Watermark>,
    /// Verdict
    pub classification: Classification,
}

/// Classifies one project's archives against its ledger
pub struct Reconciler<'a> {
    ledger: &'a dyn Ledger,
    handle: &'a LedgerHandle,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler for the project behind `handle`
    pub fn new(ledger: &'a dyn Ledger, handle: &'a LedgerHandle) -> Self {
        Self { ledger, handle }
    }

    /// Look up the archive's watermark and classify it
    pub fn reconcile(&self, bundle: ArchiveBundle) -> Result<PlannedArchive> {
        let watermark = self.ledger.lookup(self.handle, &bundle.name)?;
        let classification = classify(bundle.mtime, watermark);
        debug!(
            "{}/{} classified {}",
            self.handle.project, bundle.name, classification
        );
        Ok(PlannedArchive {
            bundle,
            watermark,
            classification,
        })
    }
}
