use std::sync::Arc;

use serde_json::{Map, Value};

use atelier_contracts::collaborators::{AuthHeaders, CredentialProvider};
use atelier_contracts::models::{BackendKind, ModelVariant};
use atelier_contracts::tasks::{StatusSnapshot, TaskStatus};

use crate::config::{EngineConfig, FluxSettings, SoraSettings};
use crate::credentials::StaticKeyCredentials;
use crate::error::{EngineResult, GenerationError};

/// URLs and wire conventions of one backend.
pub trait BackendEndpoints: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn submit_url(&self, variant: ModelVariant) -> String;
    fn status_url(&self, task_id: &str) -> String;
    fn credentials(&self) -> &dyn CredentialProvider;

    /// Adds backend-owned fields (deployment names and the like) to a built
    /// payload.
    fn prepare_payload(&self, payload: Map<String, Value>) -> Map<String, Value> {
        payload
    }

    fn parse_task_id(&self, response: &Value) -> Option<String> {
        response
            .get("id")
            .and_then(|value| match value {
                Value::String(raw) => Some(raw.trim().to_string()),
                Value::Number(raw) => Some(raw.to_string()),
                _ => None,
            })
            .filter(|value| !value.is_empty())
    }

    fn parse_status(&self, task_id: &str, response: &Value) -> StatusSnapshot;

    fn auth_headers(&self) -> EngineResult<AuthHeaders> {
        self.credentials()
            .auth_headers()
            .map_err(|err| GenerationError::Transport {
                context: format!("{} credentials", self.kind()),
                message: format!("{err:#}"),
            })
    }
}

pub struct FluxBackend {
    api_base: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl FluxBackend {
    pub fn new(settings: &FluxSettings) -> Self {
        Self::with_credentials(
            &settings.api_base,
            Arc::new(StaticKeyCredentials::bearer(&settings.api_key)),
        )
    }

    pub fn with_credentials(api_base: &str, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            credentials,
        }
    }
}

impl BackendEndpoints for FluxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Flux
    }

    fn submit_url(&self, variant: ModelVariant) -> String {
        format!("{}/v1/{}", self.api_base, variant.as_str())
    }

    fn status_url(&self, task_id: &str) -> String {
        format!("{}/v1/get_result?id={task_id}", self.api_base)
    }

    fn credentials(&self) -> &dyn CredentialProvider {
        self.credentials.as_ref()
    }

    fn parse_status(&self, task_id: &str, response: &Value) -> StatusSnapshot {
        let raw_status = response
            .get("status")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let mut snapshot = StatusSnapshot {
            task_id: task_id.to_string(),
            status: TaskStatus::Polling,
            raw_status: raw_status.clone(),
            result_refs: Vec::new(),
            error_detail: None,
            raw: response.clone(),
        };
        // Only the exact "Ready" and "Error" values are terminal; "Pending",
        // "Task not found" and moderation notices keep the wait going.
        match raw_status.as_str() {
            "Ready" => {
                snapshot.status = TaskStatus::Ready;
                snapshot.result_refs = response
                    .get("result")
                    .and_then(|row| row.get("sample"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| vec![value.to_string()])
                    .unwrap_or_default();
            }
            "Error" => {
                snapshot.status = TaskStatus::Error;
                snapshot.error_detail = Some(
                    response
                        .get("error")
                        .map(|value| match value {
                            Value::String(text) => text.clone(),
                            other => other.to_string(),
                        })
                        .filter(|text| !text.trim().is_empty())
                        .unwrap_or_else(|| "Unknown error".to_string()),
                );
            }
            _ => {}
        }
        snapshot
    }
}

/// Filters for listing video jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobListQuery {
    pub limit: u32,
    pub before: Option<String>,
    pub after: Option<String>,
    pub statuses: Vec<String>,
}

impl Default for JobListQuery {
    fn default() -> Self {
        Self {
            limit: 10,
            before: None,
            after: None,
            statuses: Vec::new(),
        }
    }
}

pub struct SoraBackend {
    base_url: String,
    deployment: String,
    api_version: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl SoraBackend {
    pub fn new(settings: &SoraSettings) -> Self {
        Self::with_credentials(
            settings,
            Arc::new(StaticKeyCredentials::header("api-key", settings.api_key.clone())),
        )
    }

    pub fn with_credentials(settings: &SoraSettings, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            base_url: settings.base_url.trim().trim_end_matches('/').to_string(),
            deployment: settings.deployment.clone(),
            api_version: settings.api_version.clone(),
            credentials,
        }
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    pub fn content_url(&self, generation_id: &str) -> String {
        format!(
            "{}/generations/{generation_id}/content/video?api-version={}",
            self.base_url, self.api_version
        )
    }

    pub fn list_jobs_url(&self, query: &JobListQuery) -> String {
        let mut url = format!(
            "{}/generations/jobs?api-version={}&limit={}",
            self.base_url, self.api_version, query.limit
        );
        if let Some(before) = query.before.as_deref().filter(|value| !value.is_empty()) {
            url.push_str(&format!("&before={before}"));
        }
        if let Some(after) = query.after.as_deref().filter(|value| !value.is_empty()) {
            url.push_str(&format!("&after={after}"));
        }
        if !query.statuses.is_empty() {
            url.push_str(&format!("&statuses={}", query.statuses.join(",")));
        }
        url
    }

    pub fn delete_job_url(&self, job_id: &str) -> String {
        self.status_url(job_id)
    }
}

impl BackendEndpoints for SoraBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sora
    }

    fn submit_url(&self, _variant: ModelVariant) -> String {
        format!(
            "{}/generations/jobs?api-version={}",
            self.base_url, self.api_version
        )
    }

    fn status_url(&self, task_id: &str) -> String {
        format!(
            "{}/generations/jobs/{task_id}?api-version={}",
            self.base_url, self.api_version
        )
    }

    fn credentials(&self) -> &dyn CredentialProvider {
        self.credentials.as_ref()
    }

    fn prepare_payload(&self, payload: Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("model".to_string(), Value::String(self.deployment.clone()));
        out.extend(payload);
        out
    }

    fn parse_status(&self, task_id: &str, response: &Value) -> StatusSnapshot {
        let raw_status = response
            .get("status")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let mut snapshot = StatusSnapshot {
            task_id: task_id.to_string(),
            status: TaskStatus::Polling,
            raw_status: raw_status.clone(),
            result_refs: Vec::new(),
            error_detail: None,
            raw: response.clone(),
        };
        match raw_status.to_ascii_lowercase().as_str() {
            "succeeded" => {
                snapshot.status = TaskStatus::Ready;
                snapshot.result_refs = response
                    .get("generations")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .filter_map(|row| row.get("id").and_then(Value::as_str))
                            .map(|id| self.content_url(id))
                            .collect()
                    })
                    .unwrap_or_default();
            }
            "failed" | "cancelled" => {
                snapshot.status = TaskStatus::Error;
                snapshot.error_detail = Some(
                    response
                        .get("failure_reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .filter(|text| !text.trim().is_empty())
                        .unwrap_or_else(|| format!("video job {raw_status}")),
                );
            }
            _ => {}
        }
        snapshot
    }
}

/// Configured backends. A missing entry means its credentials were absent.
#[derive(Default)]
pub struct BackendSet {
    pub flux: Option<FluxBackend>,
    pub sora: Option<SoraBackend>,
}

impl BackendSet {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            flux: config.flux.as_ref().map(FluxBackend::new),
            sora: config.sora.as_ref().map(SoraBackend::new),
        }
    }

    pub fn endpoints(&self, kind: BackendKind) -> EngineResult<&dyn BackendEndpoints> {
        let found: Option<&dyn BackendEndpoints> = match kind {
            BackendKind::Flux => self.flux.as_ref().map(|row| row as &dyn BackendEndpoints),
            BackendKind::Sora => self.sora.as_ref().map(|row| row as &dyn BackendEndpoints),
        };
        found.ok_or_else(|| not_configured(kind))
    }

    pub fn sora(&self) -> EngineResult<&SoraBackend> {
        self.sora
            .as_ref()
            .ok_or_else(|| not_configured(BackendKind::Sora))
    }
}

fn not_configured(kind: BackendKind) -> GenerationError {
    GenerationError::SubmissionRejected {
        status_code: 503,
        body: format!("{kind} backend not configured"),
    }
}
