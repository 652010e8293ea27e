//! Upload ledger
//!
//! The ledger remembers, per project and archive, when the archive was last
//! uploaded successfully. Its observable semantics are small:
//!
//! - an entry exists ⇔ the archive was uploaded at least once
//! - the entry's timestamp is the **watermark**; an archive whose mtime is
//!   strictly later has changed since that upload
//!
//! Entries are never removed by scansync. Deleting one by hand is how an
//! operator forces a re-upload.
//!
//! ## Backends
//!
//! [`LinkLedger`] is the on-disk layout shared with existing deployments:
//!
//! ```text
//! <ledger_root>/<project>/<archive-name>  ->  <path of the archive>
//! ```
//!
//! Each marker is a symbolic link whose *own* mtime (not its target's) is the
//! watermark, so a dangling marker still carries a valid watermark.
//!
//! [`IndexLedger`] keeps the same information in one JSON document per
//! project, `<ledger_root>/<project>/.scansync-ledger.json`, replaced with a
//! write-to-temp-then-rename on every update.
//!
//! ## Crash behaviour
//!
//! Marking happens strictly after a successful upload. A crash in between
//! leaves the entry as it was, so the archive is classified new or stale on
//! the next run and uploaded again; remote overwrite makes that harmless.

use crate::error::{Result, SyncError};
use crate::types::Watermark;
use crate::utils;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace, warn};

/// File name of the per-project index used by [`IndexLedger`]
pub const INDEX_FILE_NAME: &str = ".scansync-ledger.json";

/// A project's ledger, ready for lookups and updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerHandle {
    /// Project name
    pub project: String,
    /// Per-project ledger directory
    pub dir: PathBuf,
}

/// Persistent mapping from archive name to watermark
///
/// Implementations must be usable from several upload workers at once; the
/// orchestrator guarantees no two workers touch the same archive.
pub trait Ledger: Send + Sync {
    /// Handle for `project` without touching the filesystem
    ///
    /// Lookups through a handle whose directory does not exist yet find no
    /// entries. Dry runs use this to avoid creating ledger directories.
    fn handle(&self, project: &str) -> LedgerHandle;

    /// Create the project's ledger directory if absent
    ///
    /// # Errors
    ///
    /// - [`SyncError::LedgerCreate`] if the directory cannot be created
    fn ensure_project(&self, project: &str) -> Result<LedgerHandle>;

    /// Watermark recorded for `archive_name`, or `None` when never uploaded
    fn lookup(&self, handle: &LedgerHandle, archive_name: &str) -> Result<Option<Watermark>>;

    /// Record a successful upload with watermark `at`
    ///
    /// An existing entry keeps its identity and gets the new watermark; a
    /// missing entry is created pointing at `archive_path`.
    fn mark(
        &self,
        handle: &LedgerHandle,
        archive_name: &str,
        archive_path: &Path,
        at: Watermark,
    ) -> Result<()>;

    /// Record a successful upload that happened now
    fn touch_or_create(
        &self,
        handle: &LedgerHandle,
        archive_name: &str,
        archive_path: &Path,
    ) -> Result<()> {
        self.mark(handle, archive_name, archive_path, SystemTime::now())
    }
}

fn handle_in(root: &Path, project: &str) -> LedgerHandle {
    LedgerHandle {
        project: project.to_string(),
        dir: root.join(project),
    }
}

fn ensure_dir(root: &Path, project: &str) -> Result<LedgerHandle> {
    let handle = handle_in(root, project);
    if !handle.dir.is_dir() {
        fs::create_dir_all(&handle.dir).map_err(|source| SyncError::LedgerCreate {
            path: handle.dir.clone(),
            source,
        })?;
        debug!("Created ledger directory {:?}", handle.dir);
    }
    Ok(handle)
}

fn check_name(archive_name: &str) -> Result<()> {
    if archive_name.is_empty()
        || archive_name == "."
        || archive_name == ".."
        || archive_name.contains('/')
        || archive_name.contains('\\')
    {
        return Err(SyncError::ledger(format!(
            "invalid archive name for a ledger entry: {:?}",
            archive_name
        )));
    }
    Ok(())
}

/// Ledger of symbolic-link markers
#[derive(Debug, Clone)]
pub struct LinkLedger {
    root: PathBuf,
}

impl LinkLedger {
    /// Create a link ledger rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path of the marker for `archive_name`
    pub fn marker_path(handle: &LedgerHandle, archive_name: &str) -> PathBuf {
        handle.dir.join(archive_name)
    }
}

impl Ledger for LinkLedger {
    fn handle(&self, project: &str) -> LedgerHandle {
        handle_in(&self.root, project)
    }

    fn ensure_project(&self, project: &str) -> Result<LedgerHandle> {
        ensure_dir(&self.root, project)
    }

    fn lookup(&self, handle: &LedgerHandle, archive_name: &str) -> Result<Option<Watermark>> {
        check_name(archive_name)?;
        let marker = Self::marker_path(handle, archive_name);
        match fs::symlink_metadata(&marker) {
            Ok(metadata) => {
                if !metadata.file_type().is_symlink() {
                    warn!("Ledger entry {:?} is not a symbolic link; using its own mtime", marker);
                }
                Ok(Some(metadata.modified()?))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn mark(
        &self,
        handle: &LedgerHandle,
        archive_name: &str,
        archive_path: &Path,
        at: Watermark,
    ) -> Result<()> {
        check_name(archive_name)?;
        let marker = Self::marker_path(handle, archive_name);
        let stamp = FileTime::from_system_time(at);

        match fs::symlink_metadata(&marker) {
            Ok(_) => {
                filetime::set_symlink_file_times(&marker, stamp, stamp)?;
                trace!("Refreshed marker {:?}", marker);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Stage the link under a hidden name so the marker only ever
                // appears with its final watermark.
                utils::remove_stale_staging(&marker)?;
                let staged = utils::staging_path(&marker);
                utils::create_symlink(archive_path, &staged)?;
                let placed = filetime::set_symlink_file_times(&staged, stamp, stamp)
                    .map_err(SyncError::from)
                    .and_then(|_| fs::rename(&staged, &marker).map_err(SyncError::from));
                if let Err(e) = placed {
                    let _ = fs::remove_file(&staged);
                    return Err(e);
                }
                debug!("Created marker {:?} -> {:?}", marker, archive_path);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// One archive's record in an [`IndexLedger`] document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Time of the last successful upload
    pub watermark: DateTime<Utc>,
    /// Archive path at that time
    pub target: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexDocument {
    schema_version: u32,
    entries: BTreeMap<String, IndexEntry>,
}

/// Ledger kept as one JSON document per project
#[derive(Debug)]
pub struct IndexLedger {
    root: PathBuf,
    cache: Mutex<HashMap<String, BTreeMap<String, IndexEntry>>>,
}

impl IndexLedger {
    /// Create an index ledger rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn index_path(handle: &LedgerHandle) -> PathBuf {
        handle.dir.join(INDEX_FILE_NAME)
    }

    fn load(path: &Path) -> Result<BTreeMap<String, IndexEntry>> {
        match fs::read_to_string(path) {
            Ok(raw) => {
                let doc: IndexDocument = serde_json::from_str(&raw).map_err(|e| {
                    SyncError::ledger(format!("cannot parse {}: {}", path.display(), e))
                })?;
                Ok(doc.entries)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// All entries recorded for a project
    pub fn entries(&self, handle: &LedgerHandle) -> Result<BTreeMap<String, IndexEntry>> {
        let mut cache = self.cache.lock();
        if let Some(entries) = cache.get(&handle.project) {
            return Ok(entries.clone());
        }
        let entries = Self::load(&Self::index_path(handle))?;
        cache.insert(handle.project.clone(), entries.clone());
        Ok(entries)
    }
}

impl Ledger for IndexLedger {
    fn handle(&self, project: &str) -> LedgerHandle {
        handle_in(&self.root, project)
    }

    fn ensure_project(&self, project: &str) -> Result<LedgerHandle> {
        let handle = ensure_dir(&self.root, project)?;
        let entries = Self::load(&Self::index_path(&handle))?;
        debug!("Loaded {} ledger entries for {}", entries.len(), project);
        self.cache.lock().insert(project.to_string(), entries);
        Ok(handle)
    }

    fn lookup(&self, handle: &LedgerHandle, archive_name: &str) -> Result<Option<Watermark>> {
        check_name(archive_name)?;
        let entries = self.entries(handle)?;
        Ok(entries.get(archive_name).map(|e| SystemTime::from(e.watermark)))
    }

    fn mark(
        &self,
        handle: &LedgerHandle,
        archive_name: &str,
        archive_path: &Path,
        at: Watermark,
    ) -> Result<()> {
        check_name(archive_name)?;
        let path = Self::index_path(handle);

        // Hold the lock across read-modify-write so parallel workers in the
        // same project cannot drop each other's entries.
        let mut cache = self.cache.lock();
        let mut entries = match cache.get(&handle.project) {
            Some(entries) => entries.clone(),
            None => Self::load(&path)?,
        };
        entries.insert(
            archive_name.to_string(),
            IndexEntry {
                watermark: utils::to_utc(at),
                target: archive_path.to_path_buf(),
            },
        );

        let doc = IndexDocument {
            schema_version: 1,
            entries,
        };
        let data = serde_json::to_string_pretty(&doc)?;
        utils::atomic_write(&path, format!("{data}\n").as_bytes())?;
        cache.insert(handle.project.clone(), doc.entries);
        trace!("Recorded {} in {:?}", archive_name, path);
        Ok(())
    }
}
