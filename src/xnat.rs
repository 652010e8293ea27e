//! XNAT REST implementation of the archive capability
//!
//! Authentication uses a server session: `POST /data/JSESSION` with basic
//! credentials returns a session id that is sent as the `JSESSIONID` cookie
//! on later calls, and `DELETE /data/JSESSION` ends it when the
//! [`XnatSession`] is dropped. Without credentials requests are anonymous.
//!
//! Every call is subject to the client's request timeout; a timed out call
//! surfaces as [`SyncError::Http`] and leaves the archive unmarked.

use crate::client::{ArchiveClient, ArchiveSession, Experiment, ImportRequest, Subject, SubjectAdmin};
use crate::config::{Credentials, SyncConfig};
use crate::error::{Result, SyncError};
use crate::types::OverwritePolicy;
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Longest response body kept in an error message
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Connection factory for one XNAT server
#[derive(Debug, Clone)]
pub struct XnatClient {
    base: Url,
    credentials: Option<Credentials>,
    http: Client,
}

impl XnatClient {
    /// Create a client for `endpoint`
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidConfiguration`] if the endpoint is not a URL
    /// - [`SyncError::Http`] if the HTTP client cannot be built
    pub fn new(endpoint: &str, credentials: Option<Credentials>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(endpoint)
            .map_err(|e| SyncError::config(format!("invalid endpoint {:?}: {}", endpoint, e)))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::config(format!("endpoint {:?} cannot be a base URL", endpoint)));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base,
            credentials,
            http,
        })
    }

    /// Create a client from a run configuration
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(&config.endpoint, config.credentials.clone(), config.request_timeout())
    }
}

impl ArchiveClient for XnatClient {
    type Session = XnatSession;

    fn connect(&self) -> Result<XnatSession> {
        let mut session = XnatSession {
            base: self.base.clone(),
            http: self.http.clone(),
            session_id: None,
        };
        if let Some(creds) = &self.credentials {
            let url = session.url(&["data", "JSESSION"])?;
            let response = self
                .http
                .post(url)
                .basic_auth(&creds.username, Some(&creds.password))
                .send()?;
            let response = expect_success(response, "login")?;
            let id = response.text()?.trim().to_string();
            if id.is_empty() {
                return Err(SyncError::upload(None, "login returned an empty session id"));
            }
            debug!("Opened session on {} as {}", self.base, creds.username);
            session.session_id = Some(id);
        }
        Ok(session)
    }
}

/// An open XNAT session, closed on drop
#[derive(Debug)]
pub struct XnatSession {
    base: Url,
    http: Client,
    session_id: Option<String>,
}

impl XnatSession {
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::config(format!("endpoint {} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn experiment_url(&self, experiment: &Experiment, tail: &[&str]) -> Result<Url> {
        let mut segments: Vec<&str> = experiment.uri.split('/').filter(|s| !s.is_empty()).collect();
        segments.extend_from_slice(tail);
        self.url(&segments)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.session_id {
            Some(id) => builder.header(COOKIE, format!("JSESSIONID={id}")),
            None => builder,
        }
    }

    fn get_json(&self, url: Url, what: &str) -> Result<Value> {
        let response = self.authed(self.http.get(url).query(&[("format", "json")])).send()?;
        let response = expect_success(response, what)?;
        Ok(response.json()?)
    }
}

impl Drop for XnatSession {
    fn drop(&mut self) {
        let Some(id) = self.session_id.take() else {
            return;
        };
        let Ok(url) = self.url(&["data", "JSESSION"]) else {
            return;
        };
        match self
            .http
            .delete(url)
            .header(COOKIE, format!("JSESSIONID={id}"))
            .send()
        {
            Ok(_) => trace!("Closed session on {}", self.base),
            Err(e) => warn!("Failed to close session on {}: {}", self.base, e),
        }
    }
}

impl ArchiveSession for XnatSession {
    fn import(&self, request: &ImportRequest) -> Result<Experiment> {
        if !request.path.is_file() {
            return Err(SyncError::upload(
                None,
                format!("file to import does not exist: {}", request.path.display()),
            ));
        }

        let url = self.url(&["data", "services", "import"])?;
        let query = import_query(request);
        let body = Body::from(File::open(&request.path)?);
        let response = self
            .authed(self.http.post(url))
            .query(&query)
            .header(CONTENT_TYPE, request.content_type.as_str())
            .body(body)
            .send()?;
        let response = expect_success(response, "import")?;
        let text = response.text()?;

        let uri = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| SyncError::upload(Some(200), "import response did not name an experiment"))?;
        debug!("Imported {:?} as {}", request.path, uri);
        Ok(Experiment::new(uri))
    }

    fn list_resources(&self, experiment: &Experiment) -> Result<BTreeSet<String>> {
        let url = self.experiment_url(experiment, &["resources"])?;
        let json = self.get_json(url, "resource listing")?;
        Ok(result_rows(&json)
            .iter()
            .filter_map(|row| row.get("label").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    fn create_resource(&self, experiment: &Experiment, label: &str) -> Result<()> {
        let url = self.experiment_url(experiment, &["resources", label])?;
        let response = self.authed(self.http.put(url)).send()?;
        if response.status() == StatusCode::CONFLICT {
            return Err(SyncError::ResourceExists(label.to_string()));
        }
        expect_success(response, "resource creation")?;
        debug!("Created resource {} on {}", label, experiment.uri);
        Ok(())
    }

    fn upload_into_resource(
        &self,
        experiment: &Experiment,
        label: &str,
        file_path: &Path,
        remote_name: &str,
        overwrite: OverwritePolicy,
    ) -> Result<()> {
        let url = self.experiment_url(experiment, &["resources", label, "files", remote_name])?;
        let mut query = vec![("inbody", "true")];
        if overwrite != OverwritePolicy::None {
            query.push(("overwrite", "true"));
        }
        let body = Body::from(File::open(file_path)?);
        let response = self
            .authed(self.http.put(url))
            .query(&query)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()?;
        expect_success(response, "resource upload")?;
        debug!("Uploaded {} into {}/{}", remote_name, experiment.uri, label);
        Ok(())
    }
}

impl SubjectAdmin for XnatSession {
    fn find_project(&self, project: &str) -> Result<()> {
        let url = self.url(&["data", "projects", project])?;
        let response = self
            .authed(self.http.get(url).query(&[("format", "json")]))
            .send()?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(SyncError::ProjectNotFound(format!(
            "{} (status {})",
            project,
            response.status().as_u16()
        )))
    }

    fn list_subjects(&self, project: &str) -> Result<Vec<Subject>> {
        let url = self.url(&["data", "projects", project, "subjects"])?;
        let json = self
            .get_json(url, "subject listing")
            .map_err(|e| SyncError::SubjectListing(e.to_string()))?;
        Ok(result_rows(&json)
            .iter()
            .filter_map(|row| {
                let id = row.get("ID").and_then(Value::as_str)?;
                let label = row.get("label").and_then(Value::as_str).unwrap_or(id);
                Some(Subject {
                    id: id.to_string(),
                    label: label.to_string(),
                })
            })
            .collect())
    }

    fn delete_subject(&self, project: &str, subject: &Subject) -> Result<()> {
        let url = self.url(&["data", "projects", project, "subjects", subject.id.as_str()])?;
        let response = self
            .authed(self.http.delete(url))
            .query(&[("removeFiles", "true")])
            .send()?;
        expect_success(response, "subject deletion")?;
        Ok(())
    }
}

fn import_query(request: &ImportRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("overwrite", request.overwrite.as_str().to_string()),
        ("inbody", "true".to_string()),
    ];
    if let Some(project) = &request.project {
        query.push(("project", project.clone()));
    }
    if let Some(handler) = &request.import_handler {
        query.push(("import-handler", handler.clone()));
    }
    if request.rename {
        query.push(("rename", "true".to_string()));
    }
    if request.direct_archive {
        query.push(("Direct-Archive", "true".to_string()));
    }
    query
}

fn result_rows(json: &Value) -> Vec<Value> {
    json.get("ResultSet")
        .and_then(|v| v.get("Result"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn expect_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let body: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    Err(SyncError::upload(
        Some(status.as_u16()),
        format!("{} rejected: {}", what, body),
    ))
}
