//! Pushing archives to the remote system
//!
//! Uploading one archive is a fixed sequence against a fresh session:
//!
//! 1. import the archive into the project, replacing any existing remote copy
//! 2. make sure the experiment carries the sidecar resource, creating it if
//!    the listing does not show it
//! 3. upload the same archive file into the sidecar resource, replacing any
//!    existing copy
//!
//! Step 2 is check-then-act. If the resource appears between the listing and
//! the create call, the create's "already exists" answer counts as success.
//!
//! Any failure is returned to the caller and must not lead to a ledger
//! update, so the archive is retried on the next run.

use crate::client::{ArchiveClient, ArchiveSession, Experiment, ImportRequest};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::packing;
use crate::types::{ArchiveBundle, OverwritePolicy};
use std::path::Path;
use tracing::{debug, info};

/// Uploads archive bundles through an [`ArchiveClient`]
pub struct Uploader<'a, C: ArchiveClient> {
    client: &'a C,
    sidecar_label: String,
    content_type: String,
}

impl<'a, C: ArchiveClient> Uploader<'a, C> {
    /// Create an uploader using `config`'s sidecar label and content type
    pub fn new(client: &'a C, config: &SyncConfig) -> Self {
        Self {
            client,
            sidecar_label: config.sidecar_label.clone(),
            content_type: config.content_type.clone(),
        }
    }

    /// Upload `bundle` into `project`
    ///
    /// # Errors
    ///
    /// - [`SyncError::Upload`] / [`SyncError::Http`] for any remote failure
    /// - [`SyncError::Packing`] if a directory bundle cannot be packed
    pub fn upload(&self, bundle: &ArchiveBundle, project: &str) -> Result<Experiment> {
        let copy = packing::prepare(bundle, &self.content_type)?;
        let session = self.client.connect()?;

        let request = ImportRequest::archive(copy.path(), project, copy.content_type());
        let experiment = session.import(&request)?;
        info!("Imported {} into {} as {}", bundle.name, project, experiment.uri);

        ensure_resource(&session, &experiment, &self.sidecar_label)?;
        session.upload_into_resource(
            &experiment,
            &self.sidecar_label,
            copy.path(),
            copy.remote_name(),
            OverwritePolicy::Delete,
        )?;
        debug!(
            "Attached {} to {} under {}",
            copy.remote_name(),
            experiment.uri,
            self.sidecar_label
        );
        Ok(experiment)
    }
}

/// Make sure `experiment` has a resource named `label`
pub fn ensure_resource<S: ArchiveSession>(
    session: &S,
    experiment: &Experiment,
    label: &str,
) -> Result<()> {
    if session.list_resources(experiment)?.contains(label) {
        return Ok(());
    }
    match session.create_resource(experiment, label) {
        Ok(()) => Ok(()),
        Err(SyncError::ResourceExists(_)) => {
            debug!("Resource {} on {} appeared concurrently", label, experiment.uri);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Import one file with the single-file DICOM settings
///
/// This is the primitive behind the one-shot upload commands. It fails with
/// [`SyncError::Upload`] if `path` is not an existing file.
pub fn upload_file<S: ArchiveSession>(
    session: &S,
    path: &Path,
    project: Option<&str>,
) -> Result<Experiment> {
    if !path.is_file() {
        return Err(SyncError::upload(
            None,
            format!("the file you are trying to import does not exist: {}", path.display()),
        ));
    }
    let request = ImportRequest::single_file(path, project);
    session.import(&request)
}
