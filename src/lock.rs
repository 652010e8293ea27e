//! Per-project advisory locks
//!
//! Two runs touching the same project's ledger at once could race on marker
//! creation. Each project is therefore processed under an exclusive,
//! non-blocking `flock`-style lock on `<ledger_root>/.locks/<project>.lock`.
//! A held lock is reported as [`SyncError::LockHeld`] and the project is
//! skipped for this run; other projects are unaffected.
//!
//! The lock file records who holds it so the error can name the owner. The
//! lock is released when the [`ProjectLock`] is dropped or the process exits;
//! the file itself is left in place.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory under the ledger root holding lock files
pub const LOCK_DIR_NAME: &str = ".locks";

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
}

/// An acquired project lock, released on drop
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    /// Lock file path for `project` under `ledger_root`
    pub fn path_for(ledger_root: &Path, project: &str) -> PathBuf {
        ledger_root.join(LOCK_DIR_NAME).join(format!("{project}.lock"))
    }

    /// Try to take the lock for `project` without waiting
    ///
    /// # Errors
    ///
    /// - [`SyncError::LockHeld`] if another process holds it
    /// - [`SyncError::Io`] if the lock file cannot be created or the
    ///   filesystem refuses the lock
    pub fn acquire(ledger_root: &Path, project: &str) -> Result<Self> {
        let path = Self::path_for(ledger_root, project);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            return Err(lock_error(e, path, &mut file));
        }

        let owner = LockOwner {
            pid: std::process::id(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        serde_json::to_writer(&mut file, &owner)?;
        file.flush()?;

        debug!("Acquired lock {:?}", path);
        Ok(Self { file, path })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

/// Contention becomes [`SyncError::LockHeld`]; anything else (for example
/// a filesystem without lock support) is passed through as I/O.
fn lock_error(e: io::Error, path: PathBuf, file: &mut File) -> SyncError {
    let contended = e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
    if !contended {
        warn!("Cannot lock {:?}: {}", path, e);
        return SyncError::Io(e);
    }
    let owner = read_owner(file).unwrap_or_else(|| "another process".to_string());
    SyncError::LockHeld { path, owner }
}

fn read_owner(file: &mut File) -> Option<String> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    let owner: LockOwner = serde_json::from_str(&raw).ok()?;
    Some(format!(
        "pid {} on {} since {}",
        owner.pid,
        owner.hostname,
        owner.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
    ))
}
