//! Archive discovery
//!
//! [`ArchiveScanner`] walks one project's data directory and yields every
//! entry, at any depth, whose base name matches the configured bundle
//! patterns. The walk is lazy: entries are produced as the directory tree is
//! read, and calling [`ArchiveScanner::scan`] again starts a fresh walk.
//!
//! A matching directory is yielded as a single bundle and not descended into.
//! Entries are produced in file-name order within each directory, although
//! nothing downstream relies on that order.
//!
//! ## Change signal
//!
//! In [`ChangeDetection::Shallow`] mode a bundle's mtime is the bundle's own
//! mtime (following symbolic links). A directory's own mtime only moves when
//! entries are added or removed, so content rewritten in place goes
//! unnoticed. [`ChangeDetection::Deep`] takes the newest mtime found anywhere
//! inside the bundle instead.

use crate::config::ChangeDetection;
use crate::error::{Result, SyncError};
use crate::types::ArchiveBundle;
use globset::GlobSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Enumerates archive bundles under one project directory
#[derive(Debug, Clone)]
pub struct ArchiveScanner {
    root: PathBuf,
    matcher: GlobSet,
    change_detection: ChangeDetection,
}

impl ArchiveScanner {
    /// Create a scanner for `root` matching base names against `matcher`
    pub fn new(root: PathBuf, matcher: GlobSet) -> Self {
        Self {
            root,
            matcher,
            change_detection: ChangeDetection::Shallow,
        }
    }

    /// Set how a bundle's change signal is computed
    pub fn with_change_detection(mut self, mode: ChangeDetection) -> Self {
        self.change_detection = mode;
        self
    }

    /// Start a walk over the project directory
    ///
    /// # Errors
    ///
    /// - [`SyncError::Scan`] if the directory does not exist, is not a
    ///   directory, or cannot be listed
    pub fn scan(&self) -> Result<Bundles<'_>> {
        let metadata = fs::metadata(&self.root)
            .map_err(|e| SyncError::scan(&self.root, e.to_string()))?;
        if !metadata.is_dir() {
            return Err(SyncError::scan(&self.root, "not a directory"));
        }
        // Surface permission problems up front rather than as a walk item.
        fs::read_dir(&self.root).map_err(|e| SyncError::scan(&self.root, e.to_string()))?;

        debug!("Scanning {:?} for bundles", self.root);
        Ok(Bundles {
            scanner: self,
            walker: WalkDir::new(&self.root).sort_by_file_name().into_iter(),
        })
    }

    fn bundle_at(&self, path: &Path, name: &str) -> Result<ArchiveBundle> {
        let metadata = fs::metadata(path)?;
        let is_dir = metadata.is_dir();
        let mtime = match self.change_detection {
            ChangeDetection::Deep if is_dir => newest_mtime(path)?,
            _ => metadata.modified()?,
        };

        Ok(ArchiveBundle {
            name: name.to_string(),
            path: path.to_path_buf(),
            mtime,
            is_dir,
        })
    }
}

/// Lazy sequence of bundles produced by [`ArchiveScanner::scan`]
///
/// Items are `Err` when an entry cannot be read; the walk continues past
/// them. A matched bundle that cannot be read comes back as
/// [`SyncError::UnreadableBundle`], carrying its name and path.
pub struct Bundles<'a> {
    scanner: &'a ArchiveScanner,
    walker: walkdir::IntoIter,
}

impl Iterator for Bundles<'_> {
    type Item = Result<ArchiveBundle>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            if entry.depth() == 0 {
                continue;
            }

            let Some(name) = entry.file_name().to_str() else {
                return Some(Err(SyncError::scan(entry.path(), "bundle name is not valid UTF-8")));
            };
            if !self.scanner.matcher.is_match(name) {
                continue;
            }
            if entry.file_type().is_dir() {
                self.walker.skip_current_dir();
            }

            trace!("Found bundle {:?}", entry.path());
            let bundle = self.scanner.bundle_at(entry.path(), name).map_err(|e| {
                SyncError::UnreadableBundle {
                    name: name.to_string(),
                    path: entry.path().to_path_buf(),
                    reason: e.to_string(),
                }
            });
            return Some(bundle);
        }
    }
}

/// Newest mtime of `path` and everything below it
pub fn newest_mtime(path: &Path) -> Result<SystemTime> {
    let mut newest = fs::metadata(path)?.modified()?;
    for entry in WalkDir::new(path).min_depth(1) {
        let modified = entry?.metadata()?.modified()?;
        if modified > newest {
            newest = modified;
        }
    }
    Ok(newest)
}
