//! # scansync - keep an imaging archive in step with local scan bundles
//!
//! Acquisition instruments export scan bundles into a tree of project
//! directories. scansync uploads every bundle that is new or has changed
//! since its last upload to a remote XNAT archive, and remembers what it has
//! uploaded in a **ledger** of marker links next to the data.
//!
//! ## Overview
//!
//! ```text
//! <data_root>/<project>/**/<name>.PvDatasets      archive bundles (read-only)
//! <ledger_root>/<project>/<name>.PvDatasets       marker link -> bundle
//! ```
//!
//! A marker's own modification time is the **watermark**: the time of the last
//! successful upload. Each run compares every bundle against its marker:
//!
//! - no marker: the bundle is *new* and gets uploaded
//! - bundle mtime later than the watermark: the bundle is *stale* and gets
//!   uploaded again, replacing the remote copy
//! - otherwise the bundle is *current* and left alone
//!
//! A marker is only created or refreshed after the upload succeeded, so a
//! failed or interrupted upload is simply retried on the next run. Running
//! twice in a row without changes uploads nothing the second time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scansync::{SyncConfig, SynchronizerBuilder, XnatClient};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::new("/data/projects", "/data/links").with_env_credentials();
//! let client = XnatClient::from_config(&config)?;
//!
//! let sync = SynchronizerBuilder::new(config).workers(2).build(client)?;
//! let report = sync.run()?;
//!
//! for project in &report.projects {
//!     println!("{}: {} uploaded, {} failed", project.project, project.uploaded(), project.failed());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`scanner`]: lazy discovery of bundles in a project directory
//! - [`ledger`]: the upload ledger and its two backends
//! - [`reconcile`]: the new / stale / current decision
//! - [`client`]: the remote capability as traits; [`xnat`] implements it over HTTP
//! - [`packing`]: transport copies of directory bundles
//! - [`uploader`]: import plus sidecar resource upload of one bundle
//! - [`lock`]: per-project advisory locks
//! - [`sync`]: the run loop tying everything together
//! - [`config`], [`types`], [`error`]: configuration, shared types and errors

pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod packing;
pub mod reconcile;
pub mod scanner;
pub mod sync;
pub mod types;
pub mod uploader;
pub mod xnat;

mod utils;

pub use client::{ArchiveClient, ArchiveSession, Experiment, ImportRequest, Subject, SubjectAdmin};
pub use config::{ChangeDetection, Credentials, LedgerBackend, SyncConfig};
pub use error::{Result, SyncError};
pub use ledger::{IndexLedger, Ledger, LedgerHandle, LinkLedger};
pub use reconcile::{classify, next_watermark};
pub use scanner::ArchiveScanner;
pub use sync::{Synchronizer, SynchronizerBuilder};
pub use types::*;
pub use uploader::Uploader;
pub use utils::format_bytes;
pub use xnat::XnatClient;
