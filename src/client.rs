//! Remote archive capability
//!
//! The synchroniser only needs a handful of remote operations. They are
//! expressed as traits so that the reconciliation core can be driven against
//! the real server ([`XnatClient`](crate::xnat::XnatClient)) or an in-memory
//! double in tests.
//!
//! A session is obtained per upload with [`ArchiveClient::connect`] and
//! releases its server-side resources when dropped, on every exit path.

use crate::error::Result;
use crate::types::OverwritePolicy;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Import handler used for single DICOM files
pub const GRADUAL_DICOM_HANDLER: &str = "gradual-DICOM";

/// A remote experiment record created or replaced by an import
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Experiment {
    /// Server path of the experiment, e.g.
    /// `/data/archive/projects/P/subjects/S/experiments/E`
    pub uri: String,
}

impl Experiment {
    /// Create an experiment reference from its server path
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// Parameters of one import call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    /// File to send
    pub path: PathBuf,
    /// Destination project; the server derives it from the data when absent
    pub project: Option<String>,
    /// Declared content type
    pub content_type: String,
    /// What to do with an existing remote copy
    pub overwrite: OverwritePolicy,
    /// Server-side import handler
    pub import_handler: Option<String>,
    /// Let the server rename files to its own scheme
    pub rename: bool,
    /// Skip the prearchive
    pub direct_archive: bool,
}

impl ImportRequest {
    /// Import of a whole archive bundle into `project`, replacing any
    /// existing remote copy
    pub fn archive(path: &Path, project: &str, content_type: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            project: Some(project.to_string()),
            content_type: content_type.to_string(),
            overwrite: OverwritePolicy::Delete,
            import_handler: None,
            rename: false,
            direct_archive: false,
        }
    }

    /// Import of a single file through the gradual DICOM handler, straight
    /// into the archive
    pub fn single_file(path: &Path, project: Option<&str>) -> Self {
        Self {
            path: path.to_path_buf(),
            project: project.map(str::to_string),
            content_type: guess_content_type(path).to_string(),
            overwrite: OverwritePolicy::Delete,
            import_handler: Some(GRADUAL_DICOM_HANDLER.to_string()),
            rename: true,
            direct_archive: true,
        }
    }
}

/// A connected session with the remote archive
pub trait ArchiveSession {
    /// Import a file and return the experiment it landed in
    fn import(&self, request: &ImportRequest) -> Result<Experiment>;

    /// Labels of the resources attached to `experiment`
    fn list_resources(&self, experiment: &Experiment) -> Result<BTreeSet<String>>;

    /// Attach a new, empty resource named `label`
    ///
    /// Returns [`SyncError::ResourceExists`](crate::error::SyncError::ResourceExists)
    /// when the resource is already there.
    fn create_resource(&self, experiment: &Experiment, label: &str) -> Result<()>;

    /// Upload `file_path` into the resource as `remote_name`
    fn upload_into_resource(
        &self,
        experiment: &Experiment,
        label: &str,
        file_path: &Path,
        remote_name: &str,
        overwrite: OverwritePolicy,
    ) -> Result<()>;
}

/// Factory of sessions
///
/// Clients are shared between upload workers, so they must be `Sync`.
/// Sessions are used by one worker at a time.
pub trait ArchiveClient: Send + Sync {
    /// Session type handed out by [`connect`](Self::connect)
    type Session: ArchiveSession;

    /// Open a session
    fn connect(&self) -> Result<Self::Session>;
}

/// A subject record in a remote project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Server-side identifier
    pub id: String,
    /// Human-readable label
    pub label: String,
}

/// Project administration used by the delete-all-scans command
pub trait SubjectAdmin {
    /// Succeeds when `project` exists and is visible
    fn find_project(&self, project: &str) -> Result<()>;

    /// All subjects in `project`
    fn list_subjects(&self, project: &str) -> Result<Vec<Subject>>;

    /// Delete a subject with all its experiments and files
    fn delete_subject(&self, project: &str, subject: &Subject) -> Result<()>;
}

/// Guess the content type of a file from its extension
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("dcm") | Some("ima") => "application/dicom",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/x-gzip",
        Some("tar") => "application/x-tar",
        _ => "application/octet-stream",
    }
}
