//! Run orchestration
//!
//! A [`Synchronizer`] ties the pieces together. For every project directory
//! under the data root it
//!
//! 1. takes the project's advisory lock (unless disabled or dry-running)
//! 2. starts a walk over the project's data directory
//! 3. opens the project's ledger, creating its directory if needed
//! 4. runs every discovered archive through classify, upload and mark
//!
//! ```text
//! DISCOVER ─► CLASSIFY ─┬─ current ─────────────────────────► skipped
//!                       └─ new/stale ─► UPLOAD ─┬─ ok ─► MARK ─► uploaded
//!                                               └─ err ─────────► failed
//! ```
//!
//! Failures are contained at the smallest scope that makes sense. A failed
//! archive is reported and left unmarked; the loop moves on. A project that
//! cannot be scanned, locked or given a ledger directory is reported and the
//! next project starts. Only configuration problems abort a run.
//!
//! ## Parallel uploads
//!
//! With `workers > 1` the archives of a project are processed on a bounded
//! `rayon` pool. Each archive's classify, upload and mark sequence runs wholly
//! on one worker, and archive names are unique within a project, so no two
//! workers ever touch the same ledger entry.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scansync::{SyncConfig, SynchronizerBuilder, XnatClient};
//!
//! let config = SyncConfig::new("/data/projects", "/data/links");
//! let client = XnatClient::from_config(&config)?;
//! let sync = SynchronizerBuilder::new(config)
//!     .on_event(|event| println!("{:?}", event))
//!     .build(client)?;
//!
//! let report = sync.run()?;
//! println!("{} uploaded, {} failed", report.total_uploaded(), report.total_failed());
//! # Ok::<(), scansync::SyncError>(())
//! ```

use crate::client::ArchiveClient;
use crate::config::{ChangeDetection, LedgerBackend, SyncConfig};
use crate::error::{Result, SyncError};
use crate::ledger::{IndexLedger, Ledger, LedgerHandle, LinkLedger};
use crate::lock::ProjectLock;
use crate::reconcile::{self, Reconciler};
use crate::scanner::ArchiveScanner;
use crate::types::{
    ArchiveBundle, ArchiveOutcome, ArchiveStatus, Classification, ProjectReport, SyncEvent,
    SyncReport,
};
use crate::uploader::Uploader;
use crate::utils;
use chrono::Utc;
use globset::GlobSet;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, info_span, instrument, warn};
use uuid::Uuid;

/// Observer invoked for every [`SyncEvent`] of a run
pub type EventCallback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Builder for [`Synchronizer`]
pub struct SynchronizerBuilder {
    config: SyncConfig,
    ledger: Option<Box<dyn Ledger>>,
    observer: Option<EventCallback>,
}

impl SynchronizerBuilder {
    /// Start from `config`
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            ledger: None,
            observer: None,
        }
    }

    /// Classify only; never upload or mark
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    /// Number of concurrent uploads per project
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// How archive changes are detected
    pub fn change_detection(mut self, mode: ChangeDetection) -> Self {
        self.config.change_detection = mode;
        self
    }

    /// Use `ledger` instead of the backend named in the configuration
    pub fn ledger(mut self, ledger: Box<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Receive progress events
    ///
    /// With more than one worker the callback is invoked from several
    /// threads.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(callback));
        self
    }

    /// Validate the configuration and build a synchronizer around `client`
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidConfiguration`] for an invalid configuration
    /// - [`SyncError::LedgerCreate`] if the ledger root cannot be created
    pub fn build<C: ArchiveClient>(self, client: C) -> Result<Synchronizer<C>> {
        let config = self.config;
        config.validate()?;
        let matcher = config.bundle_matcher()?;

        if !config.dry_run {
            fs::create_dir_all(&config.ledger_root).map_err(|source| SyncError::LedgerCreate {
                path: config.ledger_root.clone(),
                source,
            })?;
        }

        let ledger: Box<dyn Ledger> = match self.ledger {
            Some(ledger) => ledger,
            None => match config.ledger_backend {
                LedgerBackend::Links => Box::new(LinkLedger::new(config.ledger_root.clone())),
                LedgerBackend::Index => Box::new(IndexLedger::new(config.ledger_root.clone())),
            },
        };

        let pool = if config.workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.workers)
                .thread_name(|i| format!("scansync-upload-{i}"))
                .build()
                .map_err(|e| SyncError::internal(format!("cannot start upload workers: {e}")))?;
            Some(pool)
        } else {
            None
        };

        info!(
            "Synchronizer ready: data root {:?}, ledger root {:?}, endpoint {}",
            config.data_root, config.ledger_root, config.endpoint
        );
        Ok(Synchronizer {
            config,
            client,
            ledger,
            matcher,
            observer: self.observer,
            pool,
        })
    }
}

/// Reconciles local archives with the remote archive
pub struct Synchronizer<C: ArchiveClient> {
    config: SyncConfig,
    client: C,
    ledger: Box<dyn Ledger>,
    matcher: GlobSet,
    observer: Option<EventCallback>,
    pool: Option<rayon::ThreadPool>,
}

impl<C: ArchiveClient> Synchronizer<C> {
    /// Configuration in effect
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Remote client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Ledger in use
    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    /// Project directories under the data root, sorted by name
    ///
    /// Hidden directories and plain files are ignored.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Scan`] if the data root cannot be listed
    #[instrument(skip(self))]
    pub fn discover_projects(&self) -> Result<Vec<String>> {
        let root = &self.config.data_root;
        let entries = fs::read_dir(root).map_err(|e| SyncError::scan(root, e.to_string()))?;

        let mut projects = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::scan(root, e.to_string()))?;
            let Ok(name) = entry.file_name().into_string() else {
                warn!("Skipping project directory with non UTF-8 name {:?}", entry.path());
                continue;
            };
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            projects.push(name);
        }
        projects.sort();
        debug!("Discovered {} projects under {:?}", projects.len(), root);
        Ok(projects)
    }

    /// Synchronise every project under the data root
    ///
    /// # Errors
    ///
    /// Only when the data root itself cannot be listed; per-project and
    /// per-archive failures are recorded in the report.
    pub fn run(&self) -> Result<SyncReport> {
        let projects = self.discover_projects()?;
        Ok(self.run_projects(&projects))
    }

    /// Synchronise the named projects, in the given order
    pub fn run_projects(&self, projects: &[String]) -> SyncReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, dry_run = self.config.dry_run);
        let _enter = span.enter();

        let started_at = Utc::now();
        info!("Starting run over {} projects", projects.len());
        let reports: Vec<ProjectReport> = projects.iter().map(|p| self.sync_project(p)).collect();
        let report = SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            projects: reports,
        };
        info!(
            "Run finished: {} uploaded, {} failed",
            report.total_uploaded(),
            report.total_failed()
        );
        report
    }

    /// Synchronise one project
    ///
    /// Never fails: a project-level problem is recorded in
    /// [`ProjectReport::error`].
    pub fn sync_project(&self, project: &str) -> ProjectReport {
        let span = info_span!("project", name = project);
        let _enter = span.enter();

        self.emit(SyncEvent::ProjectStarted {
            project: project.to_string(),
        });
        let mut report = ProjectReport::new(project);
        if let Err(e) = self.process_project(project, &mut report) {
            warn!("Project {} abandoned: {}", project, e);
            self.emit(SyncEvent::ProjectFailed {
                project: project.to_string(),
                reason: e.user_message(),
            });
            report.error = Some(e.to_string());
        }
        report
    }

    fn process_project(&self, project: &str, report: &mut ProjectReport) -> Result<()> {
        let _lock = if self.config.lock_projects && !self.config.dry_run {
            Some(ProjectLock::acquire(&self.config.ledger_root, project)?)
        } else {
            None
        };

        let scanner = ArchiveScanner::new(self.config.project_data_dir(project), self.matcher.clone())
            .with_change_detection(self.config.change_detection);
        let bundles = scanner.scan()?;

        let handle = if self.config.dry_run {
            self.ledger.handle(project)
        } else {
            self.ledger.ensure_project(project)?
        };

        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        let mut accepted = Vec::new();
        for item in bundles {
            let bundle = match item {
                Ok(bundle) => bundle,
                Err(SyncError::UnreadableBundle { name, path, reason }) => {
                    report.outcomes.push(self.fail(&handle, &name, &path, None, None, reason));
                    continue;
                }
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", project, e);
                    continue;
                }
            };
            if let Some(first) = seen.get(&bundle.name) {
                let reason = format!(
                    "duplicate archive name; already seen at {}",
                    first.display()
                );
                report.outcomes.push(self.fail(
                    &handle,
                    &bundle.name,
                    &bundle.path,
                    Some(bundle.mtime),
                    None,
                    reason,
                ));
                continue;
            }
            seen.insert(bundle.name.clone(), bundle.path.clone());

            match &self.pool {
                // Streamed: each archive completes before the walk continues.
                None => report.outcomes.push(self.process_archive(&handle, bundle)),
                Some(_) => accepted.push(bundle),
            }
        }

        if let Some(pool) = &self.pool {
            let outcomes: Vec<ArchiveOutcome> = pool.install(|| {
                accepted
                    .into_par_iter()
                    .map(|bundle| self.process_archive(&handle, bundle))
                    .collect()
            });
            report.outcomes.extend(outcomes);
        }

        info!(
            "Project {}: {} new, {} stale, {} current, {} uploaded, {} failed",
            project,
            report.count(Classification::New),
            report.count(Classification::Stale),
            report.count(Classification::Current),
            report.uploaded(),
            report.failed()
        );
        Ok(())
    }

    /// Classify one archive and act on the verdict
    fn process_archive(&self, handle: &LedgerHandle, bundle: ArchiveBundle) -> ArchiveOutcome {
        let reconciler = Reconciler::new(self.ledger.as_ref(), handle);
        let planned = match reconciler.reconcile(bundle.clone()) {
            Ok(planned) => planned,
            Err(e) => {
                return self.fail(
                    handle,
                    &bundle.name,
                    &bundle.path,
                    Some(bundle.mtime),
                    e.status(),
                    e.to_string(),
                )
            }
        };
        let project = handle.project.as_str();
        let bundle = planned.bundle;
        let mut outcome = ArchiveOutcome {
            name: bundle.name.clone(),
            path: bundle.path.clone(),
            classification: planned.classification,
            archive_mtime: Some(utils::to_utc(bundle.mtime)),
            watermark: planned.watermark.map(utils::to_utc),
            status: ArchiveStatus::Skipped,
        };

        if !planned.classification.needs_upload() {
            info!("{} is up to date", bundle.name);
            self.emit(SyncEvent::UpToDate {
                project: project.to_string(),
                archive: bundle.name.clone(),
            });
            return outcome;
        }

        if self.config.dry_run {
            info!("{} would be uploaded ({})", bundle.name, planned.classification);
            self.emit(SyncEvent::WouldUpload {
                project: project.to_string(),
                archive: bundle.name.clone(),
                classification: planned.classification,
            });
            outcome.status = ArchiveStatus::Planned;
            return outcome;
        }

        info!("Uploading {} ({})", bundle.name, planned.classification);
        self.emit(SyncEvent::Uploading {
            project: project.to_string(),
            archive: bundle.name.clone(),
            classification: planned.classification,
        });

        let started = Instant::now();
        let result = Uploader::new(&self.client, &self.config)
            .upload(&bundle, project)
            .and_then(|_| {
                let watermark = reconcile::next_watermark(SystemTime::now(), bundle.mtime);
                self.ledger.mark(handle, &bundle.name, &bundle.path, watermark)
            });

        match result {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!("Uploaded {} in {} ms", bundle.name, duration_ms);
                self.emit(SyncEvent::Uploaded {
                    project: project.to_string(),
                    archive: bundle.name.clone(),
                    duration_ms,
                });
                outcome.status = ArchiveStatus::Uploaded { duration_ms };
                outcome
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Failed to upload {}: {}", bundle.name, reason);
                self.emit(SyncEvent::Failed {
                    project: project.to_string(),
                    archive: bundle.name.clone(),
                    reason: reason.clone(),
                });
                outcome.status = ArchiveStatus::Failed {
                    status: e.status(),
                    reason,
                };
                outcome
            }
        }
    }

    /// Outcome for an archive that failed before it could be classified
    fn fail(
        &self,
        handle: &LedgerHandle,
        name: &str,
        path: &Path,
        mtime: Option<SystemTime>,
        status: Option<u16>,
        reason: String,
    ) -> ArchiveOutcome {
        warn!("{} not processed: {}", name, reason);
        self.emit(SyncEvent::Failed {
            project: handle.project.clone(),
            archive: name.to_string(),
            reason: reason.clone(),
        });
        ArchiveOutcome {
            name: name.to_string(),
            path: path.to_path_buf(),
            classification: Classification::New,
            archive_mtime: mtime.map(utils::to_utc),
            watermark: None,
            status: ArchiveStatus::Failed { status, reason },
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }
}
