//! Run configuration
//!
//! All settings a run needs are carried in one explicit [`SyncConfig`] value
//! handed to the [`Synchronizer`](crate::sync::Synchronizer). It can be read
//! from a JSON file, and every field has a default so a file only needs to
//! mention what differs:
//!
//! ```json
//! {
//!   "data_root": "/data/projects",
//!   "ledger_root": "/data/links",
//!   "endpoint": "https://xnat.example.org",
//!   "workers": 2
//! }
//! ```

use crate::error::{Result, SyncError};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the remote user name
pub const USER_ENV: &str = "SCANSYNC_USER";
/// Environment variable holding the remote password
pub const PASSWORD_ENV: &str = "SCANSYNC_PASSWORD";

/// How an archive's change signal is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDetection {
    /// The bundle's own mtime
    #[default]
    Shallow,
    /// Newest mtime over the bundle and everything inside it
    Deep,
}

/// Where watermarks are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// One symbolic link per archive; the link's own mtime is the watermark
    #[default]
    Links,
    /// One JSON index per project, replaced atomically on each write
    Index,
}

/// Remote login
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Read credentials from `SCANSYNC_USER` / `SCANSYNC_PASSWORD`
    ///
    /// Returns `None` unless both are set and non-empty.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(USER_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).ok()?;
        if username.trim().is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.trim().to_string(),
            password,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for a synchronisation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root holding one directory per project
    pub data_root: PathBuf,
    /// Root holding one ledger directory per project
    pub ledger_root: PathBuf,
    /// Base URL of the remote archive
    pub endpoint: String,
    /// Remote login; anonymous when absent
    pub credentials: Option<Credentials>,
    /// Glob patterns a bundle's base name must match
    pub bundle_patterns: Vec<String>,
    /// Label of the sidecar resource attached to each experiment
    pub sidecar_label: String,
    /// Content type sent with bundle imports
    pub content_type: String,
    /// Timeout for each remote call, in seconds
    pub request_timeout_secs: u64,
    /// How archive changes are detected
    pub change_detection: ChangeDetection,
    /// How watermarks are stored
    pub ledger_backend: LedgerBackend,
    /// Concurrent uploads per project (1 = sequential)
    pub workers: usize,
    /// Take an advisory lock per project
    pub lock_projects: bool,
    /// Classify only; never upload or mark
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data/test_projects"),
            ledger_root: PathBuf::from("/data/test_links"),
            endpoint: "http://localhost".to_string(),
            credentials: None,
            bundle_patterns: vec!["*.PvDatasets".to_string()],
            sidecar_label: "PvDatasets".to_string(),
            content_type: "application/zip".to_string(),
            request_timeout_secs: 600,
            change_detection: ChangeDetection::Shallow,
            ledger_backend: LedgerBackend::Links,
            workers: 1,
            lock_projects: true,
            dry_run: false,
        }
    }
}

impl SyncConfig {
    /// Create a configuration for the given roots with defaults elsewhere
    pub fn new(data_root: impl Into<PathBuf>, ledger_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ledger_root: ledger_root.into(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Fill in credentials from the environment when none are configured
    pub fn with_env_credentials(mut self) -> Self {
        if self.credentials.is_none() {
            self.credentials = Credentials::from_env();
        }
        self
    }

    /// Per-call timeout for remote requests
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check the configuration for values no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.bundle_patterns.is_empty() {
            return Err(SyncError::config("at least one bundle pattern is required"));
        }
        self.bundle_matcher()?;

        if self.sidecar_label.trim().is_empty() {
            return Err(SyncError::config("sidecar label must not be empty"));
        }
        if self.workers == 0 {
            return Err(SyncError::config("workers must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::config("request timeout must be at least 1 second"));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(SyncError::config(format!(
                "endpoint must be an http(s) URL, got {:?}",
                self.endpoint
            )));
        }
        if self.data_root == self.ledger_root {
            return Err(SyncError::config("data root and ledger root must differ"));
        }
        Ok(())
    }

    /// Compile the bundle patterns into a matcher for base names
    pub fn bundle_matcher(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.bundle_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                SyncError::config(format!("invalid bundle pattern {:?}: {}", pattern, e))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| SyncError::config(format!("invalid bundle patterns: {}", e)))
    }

    /// Data directory of `project`
    pub fn project_data_dir(&self, project: &str) -> PathBuf {
        self.data_root.join(project)
    }
}
