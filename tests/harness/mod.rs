//! Shared fixtures: an in-memory remote archive and a scratch data layout

use filetime::{set_file_mtime, FileTime};
use parking_lot::Mutex;
use scansync::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

/// Everything the fake remote has been asked to do
#[derive(Debug, Default)]
pub struct RemoteState {
    /// `(project, file name)` of every import, in call order
    pub imports: Vec<(String, String)>,
    /// Resource labels per experiment
    pub resources: BTreeMap<String, BTreeSet<String>>,
    /// `(experiment, label, remote name)` of every sidecar upload
    pub sidecar_files: Vec<(String, String, String)>,
    /// File names whose import is rejected with a 500
    pub reject: HashSet<String>,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
}

/// Remote archive kept in memory, recording every call
#[derive(Clone, Default)]
pub struct RecordingClient {
    pub state: Arc<Mutex<RemoteState>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject imports of `file_name` until [`accept`](Self::accept) is called
    pub fn reject(&self, file_name: &str) {
        self.state.lock().reject.insert(file_name.to_string());
    }

    pub fn accept(&self, file_name: &str) {
        self.state.lock().reject.remove(file_name);
    }

    /// File names imported so far
    pub fn imported(&self) -> Vec<String> {
        self.state.lock().imports.iter().map(|(_, f)| f.clone()).collect()
    }

    pub fn import_count(&self) -> usize {
        self.state.lock().imports.len()
    }

    /// Remote names uploaded into sidecar resources so far
    pub fn sidecar_names(&self) -> Vec<String> {
        self.state
            .lock()
            .sidecar_files
            .iter()
            .map(|(_, _, name)| name.clone())
            .collect()
    }
}

pub struct RecordingSession {
    state: Arc<Mutex<RemoteState>>,
}

impl ArchiveClient for RecordingClient {
    type Session = RecordingSession;

    fn connect(&self) -> Result<RecordingSession> {
        self.state.lock().sessions_opened += 1;
        Ok(RecordingSession {
            state: Arc::clone(&self.state),
        })
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.state.lock().sessions_closed += 1;
    }
}

impl ArchiveSession for RecordingSession {
    fn import(&self, request: &ImportRequest) -> Result<Experiment> {
        let file = request
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let project = request.project.clone().unwrap_or_default();

        let mut state = self.state.lock();
        if state.reject.contains(&file) {
            return Err(SyncError::upload(Some(500), format!("cannot import {file}")));
        }
        state.imports.push((project.clone(), file.clone()));
        Ok(Experiment::new(format!("/data/projects/{project}/experiments/{file}")))
    }

    fn list_resources(&self, experiment: &Experiment) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .lock()
            .resources
            .get(&experiment.uri)
            .cloned()
            .unwrap_or_default())
    }

    fn create_resource(&self, experiment: &Experiment, label: &str) -> Result<()> {
        let mut state = self.state.lock();
        let labels = state.resources.entry(experiment.uri.clone()).or_default();
        if !labels.insert(label.to_string()) {
            return Err(SyncError::ResourceExists(label.to_string()));
        }
        Ok(())
    }

    fn upload_into_resource(
        &self,
        experiment: &Experiment,
        label: &str,
        file_path: &Path,
        remote_name: &str,
        _overwrite: OverwritePolicy,
    ) -> Result<()> {
        assert!(file_path.is_file(), "sidecar source {:?} must exist", file_path);
        let mut state = self.state.lock();
        let has_resource = state
            .resources
            .get(&experiment.uri)
            .is_some_and(|labels| labels.contains(label));
        if !has_resource {
            return Err(SyncError::upload(Some(404), format!("no resource {label}")));
        }
        state.sidecar_files.push((
            experiment.uri.clone(),
            label.to_string(),
            remote_name.to_string(),
        ));
        Ok(())
    }
}

/// Timestamp `secs` seconds after the epoch
pub fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Scratch `data/` and `links/` roots
pub struct Layout {
    pub temp_dir: TempDir,
    pub data_root: PathBuf,
    pub ledger_root: PathBuf,
}

impl Layout {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let data_root = temp_dir.path().join("data");
        let ledger_root = temp_dir.path().join("links");
        fs::create_dir_all(&data_root).unwrap();
        Self {
            temp_dir,
            data_root,
            ledger_root,
        }
    }

    pub fn config(&self) -> SyncConfig {
        SyncConfig::new(&self.data_root, &self.ledger_root)
    }

    pub fn project(&self, project: &str) -> PathBuf {
        let dir = self.data_root.join(project);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a file bundle at `project/rel` with mtime `secs`
    pub fn archive(&self, project: &str, rel: &str, secs: u64) -> PathBuf {
        let path = self.project(project).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("bundle {rel}")).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(secs as i64, 0)).unwrap();
        path
    }

    pub fn marker(&self, project: &str, name: &str) -> PathBuf {
        self.ledger_root.join(project).join(name)
    }

    /// The marker's own mtime, `None` when absent
    pub fn marker_mtime(&self, project: &str, name: &str) -> Option<SystemTime> {
        fs::symlink_metadata(self.marker(project, name))
            .ok()
            .map(|m| m.modified().unwrap())
    }

    /// Record an upload at `secs` through the public ledger API
    pub fn mark(&self, project: &str, name: &str, target: &Path, secs: u64) {
        let ledger = LinkLedger::new(self.ledger_root.clone());
        let handle = ledger.ensure_project(project).unwrap();
        ledger.mark(&handle, name, target, at(secs)).unwrap();
    }

    pub fn synchronizer(&self, client: &RecordingClient) -> Synchronizer<RecordingClient> {
        SynchronizerBuilder::new(self.config())
            .build(client.clone())
            .unwrap()
    }
}
