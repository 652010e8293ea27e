//! Core data types used throughout scansync
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Local state**: [`ArchiveBundle`] and [`Watermark`], the two inputs of reconciliation
//! - **Decisions**: [`Classification`], the reconciler's verdict for one archive
//! - **Remote options**: [`OverwritePolicy`] for imports and resource uploads
//! - **Results**: [`ArchiveOutcome`], [`ProjectReport`], [`SyncReport`]
//! - **Notifications**: [`SyncEvent`], delivered to an optional observer while a run progresses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

/// Timestamp recorded at the last successful upload of an archive
pub type Watermark = SystemTime;

/// A unit of acquired scan data found under a project's data directory
///
/// Bundles are created by the acquisition instrument and never modified by
/// scansync. `name` is the bundle's base name and is unique within a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveBundle {
    /// Base name of the bundle (file or directory name)
    pub name: String,
    /// Location of the bundle on disk
    pub path: PathBuf,
    /// Change signal compared against the watermark
    ///
    /// For a directory bundle in shallow mode this is the directory's own
    /// mtime, which does not move when a contained file is rewritten in place.
    pub mtime: SystemTime,
    /// Whether the bundle is a directory (packed before transport)
    pub is_dir: bool,
}

/// Reconciliation verdict for one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// No marker exists: never uploaded
    New,
    /// Marker exists but the archive changed after it
    Stale,
    /// Marker is at or after the archive's mtime
    Current,
}

impl Classification {
    /// Whether this verdict leads to an upload
    pub fn needs_upload(self) -> bool {
        !matches!(self, Classification::Current)
    }

    /// Lowercase label used in status lines and reports
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Stale => "stale",
            Classification::Current => "current",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the remote system treats data that already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Replace the existing remote copy
    #[default]
    Delete,
    /// Add to the existing remote copy
    Append,
    /// Refuse to touch existing data
    None,
}

impl OverwritePolicy {
    /// Wire value of the policy
    pub fn as_str(self) -> &'static str {
        match self {
            OverwritePolicy::Delete => "delete",
            OverwritePolicy::Append => "append",
            OverwritePolicy::None => "none",
        }
    }
}

/// Terminal state of one archive in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ArchiveStatus {
    /// Classified current, nothing done
    Skipped,
    /// Needs upload, but the run was a dry run
    Planned,
    /// Uploaded and marked in the ledger
    Uploaded {
        /// Wall time of the upload in milliseconds
        duration_ms: u64,
    },
    /// Upload or marking failed; left unmarked for the next run
    Failed {
        /// Remote status code, if the remote answered
        status: Option<u16>,
        /// Human-readable reason
        reason: String,
    },
}

/// Result of processing one archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    /// Archive base name
    pub name: String,
    /// Archive location
    pub path: PathBuf,
    /// Reconciler verdict
    pub classification: Classification,
    /// Archive mtime used for the verdict; `None` if it could not be read
    pub archive_mtime: Option<DateTime<Utc>>,
    /// Watermark consulted, if a marker existed
    pub watermark: Option<DateTime<Utc>>,
    /// What happened
    pub status: ArchiveStatus,
}

impl ArchiveOutcome {
    /// Whether this archive ended in failure
    pub fn is_failure(&self) -> bool {
        matches!(self.status, ArchiveStatus::Failed { .. })
    }
}

/// Summary of one project in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectReport {
    /// Project directory name
    pub project: String,
    /// Per-archive results in processing order
    pub outcomes: Vec<ArchiveOutcome>,
    /// Project-level failure that stopped processing, if any
    pub error: Option<String>,
}

impl ProjectReport {
    /// Create an empty report for `project`
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            outcomes: Vec::new(),
            error: None,
        }
    }

    /// Number of archives with the given classification
    pub fn count(&self, classification: Classification) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.classification == classification)
            .count()
    }

    /// Number of archives uploaded and marked
    pub fn uploaded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ArchiveStatus::Uploaded { .. }))
            .count()
    }

    /// Number of archives that failed
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    /// Whether the project completed without any failure
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.failed() == 0
    }
}

/// Summary of a whole run across projects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    /// Unique run identifier, also recorded on the run's tracing span
    pub run_id: Uuid,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
    /// Whether uploads and marking were suppressed
    pub dry_run: bool,
    /// Per-project results, sorted by project name
    pub projects: Vec<ProjectReport>,
}

impl SyncReport {
    /// Whether any project or archive failed
    pub fn has_failures(&self) -> bool {
        self.projects.iter().any(|p| !p.is_clean())
    }

    /// Total archives uploaded across projects
    pub fn total_uploaded(&self) -> usize {
        self.projects.iter().map(ProjectReport::uploaded).sum()
    }

    /// Total archives failed across projects
    pub fn total_failed(&self) -> usize {
        self.projects.iter().map(ProjectReport::failed).sum()
    }

    /// Find the report for `project`
    pub fn project(&self, project: &str) -> Option<&ProjectReport> {
        self.projects.iter().find(|p| p.project == project)
    }
}

/// Progress notification delivered to a run observer
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Processing of a project begins
    ProjectStarted {
        /// Project name
        project: String,
    },
    /// An archive was classified current and skipped
    UpToDate {
        /// Project name
        project: String,
        /// Archive name
        archive: String,
    },
    /// An upload is about to start
    Uploading {
        /// Project name
        project: String,
        /// Archive name
        archive: String,
        /// Why it is being uploaded
        classification: Classification,
    },
    /// Dry run: the archive would have been uploaded
    WouldUpload {
        /// Project name
        project: String,
        /// Archive name
        archive: String,
        /// Why it would be uploaded
        classification: Classification,
    },
    /// Upload and marking succeeded
    Uploaded {
        /// Project name
        project: String,
        /// Archive name
        archive: String,
        /// Upload wall time in milliseconds
        duration_ms: u64,
    },
    /// Upload or marking failed
    Failed {
        /// Project name
        project: String,
        /// Archive name
        archive: String,
        /// Failure reason
        reason: String,
    },
    /// The project was abandoned
    ProjectFailed {
        /// Project name
        project: String,
        /// Failure reason
        reason: String,
    },
}
