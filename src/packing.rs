//! Transport copies of archive bundles
//!
//! The remote import endpoint takes one file per request. File bundles are
//! sent as they are. Directory bundles are packed into a gzip-compressed tar
//! in the system temp directory; the copy is deleted when the returned
//! [`TransportCopy`] is dropped. The bundle itself is only read.

use crate::error::{Result, SyncError};
use crate::types::ArchiveBundle;
use flate2::{write::GzEncoder, Compression};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Content type of packed directory bundles
pub const PACKED_CONTENT_TYPE: &str = "application/x-gzip";

/// The file actually sent for a bundle
#[derive(Debug)]
pub struct TransportCopy {
    path: PathBuf,
    remote_name: String,
    content_type: String,
    // Deleted on drop.
    packed: Option<NamedTempFile>,
}

impl TransportCopy {
    /// File to send
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name the file gets on the remote side
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Content type to declare
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Whether a packed copy was produced
    pub fn is_packed(&self) -> bool {
        self.packed.is_some()
    }
}

/// Prepare the file to send for `bundle`
///
/// `content_type` applies to file bundles; packed directories always use
/// [`PACKED_CONTENT_TYPE`].
pub fn prepare(bundle: &ArchiveBundle, content_type: &str) -> Result<TransportCopy> {
    if !bundle.is_dir {
        return Ok(TransportCopy {
            path: bundle.path.clone(),
            remote_name: bundle.name.clone(),
            content_type: content_type.to_string(),
            packed: None,
        });
    }

    let packed = pack_directory(&bundle.path, &bundle.name)?;
    Ok(TransportCopy {
        path: packed.path().to_path_buf(),
        remote_name: format!("{}.tar.gz", bundle.name),
        content_type: PACKED_CONTENT_TYPE.to_string(),
        packed: Some(packed),
    })
}

fn pack_directory(dir: &Path, name: &str) -> Result<NamedTempFile> {
    let temp = tempfile::Builder::new()
        .prefix("scansync-")
        .suffix(".tar.gz")
        .tempfile()?;
    let file = temp.reopen()?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(name, dir)
        .map_err(|e| SyncError::Packing(format!("cannot pack {}: {}", dir.display(), e)))?;
    let encoder = builder
        .into_inner()
        .map_err(|e| SyncError::Packing(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Packing(e.to_string()))?
        .sync_all()?;

    debug!("Packed {:?} into {:?}", dir, temp.path());
    Ok(temp)
}
