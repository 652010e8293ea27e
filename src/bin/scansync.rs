//! # scansync CLI
//!
//! Command-line front end for the scansync library.
//!
//! ## Usage
//! ```bash
//! # Upload everything new or changed, all projects
//! scansync --data-root /data/projects --ledger-root /data/links sync
//!
//! # Only one project, four uploads at a time
//! scansync sync --project mouse_study --workers 4
//!
//! # Show what a sync would do
//! scansync status --json
//!
//! # One-shot helpers
//! scansync upload-one scan.dcm --project mouse_study
//! scansync upload-folder ./dicom --project mouse_study
//! scansync delete-project-scans mouse_study
//! ```
//!
//! Credentials are read from `SCANSYNC_USER` / `SCANSYNC_PASSWORD` unless the
//! configuration file provides them.
//!
//! ## Exit codes
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | usage or configuration error |
//! | 2 | `delete-project-scans`: project not found |
//! | 3 | `delete-project-scans`: subjects could not be listed |
//! | 4 | completed, but some archives, files or projects failed |

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use scansync::uploader;
use scansync::{
    format_bytes, ArchiveClient, ChangeDetection, LedgerBackend, SubjectAdmin, SyncConfig,
    SyncError, SyncEvent, SyncReport, SynchronizerBuilder, XnatClient,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_PROJECT_NOT_FOUND: i32 = 2;
const EXIT_SUBJECT_LISTING: i32 = 3;
const EXIT_PARTIAL_FAILURE: i32 = 4;

/// Keep a remote XNAT archive in sync with local scan bundles
#[derive(Parser)]
#[command(name = "scansync")]
#[command(version)]
#[command(about = "Upload new and changed scan bundles to an XNAT archive")]
#[command(long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root holding one directory per project
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Root holding the per-project ledgers
    #[arg(long, global = true)]
    ledger_root: Option<PathBuf>,

    /// Remote archive URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Ledger storage
    #[arg(long, global = true, value_enum)]
    ledger_backend: Option<BackendArg>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload new and changed archives and update the ledger
    Sync {
        /// Only this project
        #[arg(short, long)]
        project: Option<String>,

        /// Concurrent uploads per project
        #[arg(short, long)]
        workers: Option<usize>,

        /// Use the newest mtime inside directory bundles
        #[arg(long)]
        deep: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Show a spinner while uploading
        #[arg(long)]
        progress: bool,
    },

    /// Show what sync would do, without uploading
    #[command(alias = "st")]
    Status {
        /// Only this project
        #[arg(short, long)]
        project: Option<String>,

        /// Use the newest mtime inside directory bundles
        #[arg(long)]
        deep: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import a single file
    UploadOne {
        /// File to import
        file: PathBuf,

        /// Destination project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Import every DICOM file under a folder, deleting each once uploaded
    UploadFolder {
        /// Folder to walk
        dir: PathBuf,

        /// Destination project
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Delete every subject of a remote project
    DeleteProjectScans {
        /// Remote project id
        project: String,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Links,
    Index,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_logging(cli.verbose);

    if std::env::var_os("NO_COLOR").is_some() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let message = match e.downcast_ref::<SyncError>() {
                Some(err) => err.user_message(),
                None => format!("{:#}", e),
            };
            eprintln!("{}: {}", "Error".red().bold(), message);
            std::process::exit(EXIT_USAGE);
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("scansync=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Sync {
            project,
            workers,
            deep,
            json,
            progress,
        } => cmd_sync(config, project, workers, deep, json, progress, false),
        Commands::Status { project, deep, json } => {
            cmd_sync(config, project, None, deep, json, false, true)
        }
        Commands::UploadOne { file, project } => cmd_upload_one(config, &file, project),
        Commands::UploadFolder { dir, project } => cmd_upload_folder(config, &dir, project),
        Commands::DeleteProjectScans { project } => cmd_delete_project_scans(config, &project),
    }
}

/// Configuration file (or defaults), then command-line overrides, then
/// credentials from the environment
fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    if let Some(root) = &cli.data_root {
        config.data_root = root.clone();
    }
    if let Some(root) = &cli.ledger_root {
        config.ledger_root = root.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(backend) = cli.ledger_backend {
        config.ledger_backend = match backend {
            BackendArg::Links => LedgerBackend::Links,
            BackendArg::Index => LedgerBackend::Index,
        };
    }
    Ok(config.with_env_credentials())
}

/// Reconcile projects, uploading unless `dry_run`
fn cmd_sync(
    mut config: SyncConfig,
    project: Option<String>,
    workers: Option<usize>,
    deep: bool,
    json: bool,
    show_progress: bool,
    dry_run: bool,
) -> anyhow::Result<i32> {
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if deep {
        config.change_detection = ChangeDetection::Deep;
    }
    config.dry_run = dry_run;

    let client = XnatClient::from_config(&config)?;
    let start = Instant::now();

    let spinner = if show_progress && !json {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    } else {
        None
    };

    let mut builder = SynchronizerBuilder::new(config);
    if !json {
        let spinner = spinner.clone();
        builder = builder.on_event(move |event| {
            if let (Some(pb), SyncEvent::Uploading { archive, .. }) = (&spinner, event) {
                pb.set_message(format!("uploading {archive}"));
            }
            let line = status_line(event);
            match &spinner {
                Some(pb) => pb.println(line),
                None => println!("{line}"),
            }
        });
    }
    let sync = builder.build(client)?;

    let projects = match project {
        Some(project) => vec![project],
        None => sync.discover_projects()?,
    };
    let report = sync.run_projects(&projects);

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report, start.elapsed());
    }

    Ok(if report.has_failures() {
        EXIT_PARTIAL_FAILURE
    } else {
        EXIT_OK
    })
}

/// Per-archive status line for an event
fn status_line(event: &SyncEvent) -> String {
    match event {
        SyncEvent::ProjectStarted { project } => {
            format!("{} {}", "==>".blue().bold(), project.bold())
        }
        SyncEvent::UpToDate { archive, .. } => {
            format!("  {} {}", "up-to-date".green(), archive)
        }
        SyncEvent::Uploading {
            archive,
            classification,
            ..
        } => format!("  {} {} ({})", "uploading".cyan(), archive, classification),
        SyncEvent::WouldUpload {
            archive,
            classification,
            ..
        } => format!("  {} {} ({})", "would upload".yellow(), archive, classification),
        SyncEvent::Uploaded {
            archive,
            duration_ms,
            ..
        } => format!(
            "  {} {} in {}",
            "uploaded".green().bold(),
            archive,
            format_duration(Duration::from_millis(*duration_ms))
        ),
        SyncEvent::Failed { archive, reason, .. } => {
            format!("  {} {}: {}", "failed".red().bold(), archive, reason)
        }
        SyncEvent::ProjectFailed { reason, .. } => {
            format!("  {} {}", "project skipped:".red().bold(), reason)
        }
    }
}

fn print_summary(report: &SyncReport, elapsed: Duration) {
    use scansync::Classification::{Current, New, Stale};

    println!();
    for project in &report.projects {
        let marker = if project.is_clean() {
            "✓".green().bold()
        } else {
            "✗".red().bold()
        };
        println!(
            "{} {}: {} new, {} stale, {} current, {} uploaded, {} failed",
            marker,
            project.project.bold(),
            project.count(New),
            project.count(Stale),
            project.count(Current),
            project.uploaded().to_string().cyan(),
            project.failed().to_string().red()
        );
        if let Some(error) = &project.error {
            println!("    {}", error.red());
        }
    }

    let verb = if report.dry_run { "Checked" } else { "Synced" };
    // Drop sub-second noise.
    let elapsed = Duration::from_secs(elapsed.as_secs());
    println!(
        "\n{} {} projects in {} ({} uploaded, {} failed)",
        verb,
        report.projects.len(),
        format_duration(elapsed).to_string().cyan(),
        report.total_uploaded(),
        report.total_failed()
    );
}

/// Import one file with the single-file settings
fn cmd_upload_one(config: SyncConfig, file: &Path, project: Option<String>) -> anyhow::Result<i32> {
    let client = XnatClient::from_config(&config)?;
    let session = client.connect()?;

    match uploader::upload_file(&session, file, project.as_deref()) {
        Ok(experiment) => {
            let size = fs::metadata(file).map(|m| m.len()).unwrap_or(0);
            println!(
                "{} Uploaded {} ({}) to {}",
                "✓".green().bold(),
                file.display(),
                format_bytes(size),
                experiment.uri.cyan()
            );
            Ok(EXIT_OK)
        }
        Err(e) => {
            eprintln!("{} {}: {}", "✗".red().bold(), file.display(), e.user_message());
            Ok(EXIT_PARTIAL_FAILURE)
        }
    }
}

fn is_dicom(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("dcm"))
}

/// Import every `*.dcm` under `dir`, deleting each file after its upload
fn cmd_upload_folder(config: SyncConfig, dir: &Path, project: Option<String>) -> anyhow::Result<i32> {
    if !dir.is_dir() {
        eprintln!("{}: {} is not a directory", "Error".red().bold(), dir.display());
        return Ok(EXIT_USAGE);
    }

    let client = XnatClient::from_config(&config)?;
    let session = client.connect()?;

    let mut uploaded = 0usize;
    let mut failed = 0usize;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_dicom(entry.path()) {
            continue;
        }

        let path = entry.path();
        match uploader::upload_file(&session, path, project.as_deref()) {
            Ok(_) => {
                uploaded += 1;
                println!("{} {}", "uploaded".green(), path.display());
                if let Err(e) = fs::remove_file(path) {
                    warn!("Uploaded {:?} but could not delete it: {}", path, e);
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{} {}: {}", "failed".red().bold(), path.display(), e);
            }
        }
    }

    println!("\n{} uploaded, {} failed", uploaded.to_string().cyan(), failed.to_string().red());
    Ok(if failed > 0 {
        EXIT_PARTIAL_FAILURE
    } else {
        EXIT_OK
    })
}

/// Delete every subject in `project`
fn cmd_delete_project_scans(config: SyncConfig, project: &str) -> anyhow::Result<i32> {
    let client = XnatClient::from_config(&config)?;
    let session = client.connect()?;

    if let Err(e) = session.find_project(project) {
        eprintln!("{}: {}", "Error".red().bold(), e);
        return Ok(EXIT_PROJECT_NOT_FOUND);
    }

    let subjects = match session.list_subjects(project) {
        Ok(subjects) => subjects,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            return Ok(EXIT_SUBJECT_LISTING);
        }
    };

    if subjects.is_empty() {
        println!("No subjects in project {}", project.cyan());
        return Ok(EXIT_OK);
    }

    println!("Deleting {} subjects from {}", subjects.len(), project.cyan());
    for subject in &subjects {
        match session.delete_subject(project, subject) {
            Ok(()) => println!("{} Deleted {} ({})", "✓".green().bold(), subject.label, subject.id),
            Err(e) => eprintln!(
                "{} Could not delete {} ({}): {}",
                "✗".red().bold(),
                subject.label,
                subject.id,
                e
            ),
        }
    }
    Ok(EXIT_OK)
}
