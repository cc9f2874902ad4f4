use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tracing::{info, warn};

use atelier_contracts::models::{BackendKind, GenerationParams, ModelVariant};
use atelier_contracts::pipeline::SourceImage;
use atelier_contracts::tasks::{
    Artifact, GenerationTask, MediaKind, StatusSnapshot, TaskHandle,
};

use crate::backends::{BackendEndpoints, BackendSet, JobListQuery};
use crate::config::{EngineConfig, PollPolicy};
use crate::error::{EngineResult, GenerationError};
use crate::payload::build_payload;
use crate::poller::{JobPoller, StatusReader, StatusSource, TerminalStatus};
use crate::submitter::JobSubmitter;
use crate::transport::{BackendTransport, HttpReply, HttpRequest, ReqwestTransport};
use crate::truncate_text;

/// Builder, submitter and poller wired to one transport and backend set.
///
/// Built once per process and shared read-only between pipeline runs; every
/// blocking wait happens on the caller's thread.
pub struct GenerationCoordinator {
    transport: Arc<dyn BackendTransport>,
    backends: Arc<BackendSet>,
    submitter: JobSubmitter,
    status: Arc<StatusReader>,
    poller: JobPoller,
    policy: PollPolicy,
}

impl GenerationCoordinator {
    pub fn new(
        transport: Arc<dyn BackendTransport>,
        backends: BackendSet,
        policy: PollPolicy,
    ) -> Self {
        let backends = Arc::new(backends);
        let status = Arc::new(StatusReader::new(transport.clone(), backends.clone()));
        Self {
            submitter: JobSubmitter::new(transport.clone(), backends.clone()),
            poller: JobPoller::new(status.clone()),
            status,
            transport,
            backends,
            policy,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(ReqwestTransport::new(config.request_timeout)),
            BackendSet::from_config(config),
            config.poll,
        )
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn transport(&self) -> Arc<dyn BackendTransport> {
        self.transport.clone()
    }

    /// Submits without waiting. The caller polls with [`Self::query_status`].
    pub fn submit_only(
        &self,
        model: &str,
        params: &GenerationParams,
        attachments: &[SourceImage],
    ) -> EngineResult<TaskHandle> {
        Ok(self.submit(model, params, attachments)?.handle())
    }

    pub fn query_status(&self, handle: &TaskHandle) -> EngineResult<StatusSnapshot> {
        self.status.read_status(handle)
    }

    pub fn wait_for(&self, handle: &TaskHandle, policy: PollPolicy) -> EngineResult<TerminalStatus> {
        self.poller.wait_until_terminal(handle, policy)
    }

    pub fn submit_and_wait(
        &self,
        model: &str,
        params: &GenerationParams,
        attachments: &[SourceImage],
        max_wait: Option<Duration>,
    ) -> EngineResult<GenerationTask> {
        self.submit_and_wait_with(model, params, attachments, max_wait, |_| {})
    }

    /// [`Self::submit_and_wait`] with a hook that sees the task right after
    /// submission.
    pub fn submit_and_wait_with(
        &self,
        model: &str,
        params: &GenerationParams,
        attachments: &[SourceImage],
        max_wait: Option<Duration>,
        on_submitted: impl FnOnce(&GenerationTask),
    ) -> EngineResult<GenerationTask> {
        let mut task = self.submit(model, params, attachments)?;
        on_submitted(&task);

        self.poller
            .drive(&mut task, self.policy.with_max_wait(max_wait))?;
        let backend = task.model.backend();
        if task.result_refs.is_empty() {
            warn!(task_id = %task.id, "ready task carried no result reference");
            return Err(GenerationError::InvalidResponse {
                context: format!("{backend} result"),
                message: format!("task {} is ready but carries no result reference", task.id),
            });
        }
        let mut artifacts = Vec::with_capacity(task.result_refs.len());
        for reference in &task.result_refs {
            artifacts.push(self.fetch_artifact(backend, reference)?);
        }
        task.artifacts = artifacts;
        Ok(task)
    }

    fn submit(
        &self,
        model: &str,
        params: &GenerationParams,
        attachments: &[SourceImage],
    ) -> EngineResult<GenerationTask> {
        let built = build_payload(model, params)?;
        let submission = self.submitter.submit(built.variant, built.body, attachments)?;
        Ok(GenerationTask::submitted(
            submission.task_id,
            built.variant,
            submission.payload,
        ))
    }

    /// Downloads one result reference. `data:` URLs are decoded locally.
    pub fn fetch_artifact(&self, backend: BackendKind, reference: &str) -> EngineResult<Artifact> {
        let fetch_failed = |reason: String| GenerationError::ArtifactFetchFailed {
            url: truncate_text(reference, 120),
            reason,
        };

        let (bytes, content_type) = if let Some(inline) = reference.strip_prefix("data:") {
            let (header, encoded) = inline
                .split_once(',')
                .ok_or_else(|| fetch_failed("malformed data URL".to_string()))?;
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|err| fetch_failed(format!("invalid base64: {err}")))?;
            let mime = header.trim_end_matches(";base64").to_string();
            (bytes, Some(mime).filter(|value| !value.is_empty()))
        } else {
            let endpoints = self.backends.endpoints(backend)?;
            let reply = self
                .transport
                .send(HttpRequest::get(reference, endpoints.auth_headers()?))
                .map_err(|err| fetch_failed(err.to_string()))?;
            if !reply.is_success() {
                return Err(fetch_failed(format!(
                    "HTTP {}: {}",
                    reply.status,
                    truncate_text(&reply.text(), 512)
                )));
            }
            let HttpReply {
                body, content_type, ..
            } = reply;
            (body, content_type)
        };

        let artifact = describe_artifact(reference, backend, bytes, content_type);
        info!(
            url = %truncate_text(reference, 120),
            bytes = artifact.size_bytes,
            kind = ?artifact.kind,
            "artifact downloaded"
        );
        Ok(artifact)
    }

    pub fn list_video_jobs(&self, query: &JobListQuery) -> EngineResult<Value> {
        let sora = self.backends.sora()?;
        let reply = self
            .transport
            .send(HttpRequest::get(sora.list_jobs_url(query), sora.auth_headers()?))?;
        reply.json("video job listing")
    }

    pub fn delete_video_job(&self, job_id: &str) -> EngineResult<u16> {
        let sora = self.backends.sora()?;
        let reply = self
            .transport
            .send(HttpRequest::delete(sora.delete_job_url(job_id), sora.auth_headers()?))?;
        if !reply.is_success() {
            return Err(GenerationError::rejected(reply.status, &reply.text()));
        }
        info!(job_id, status = reply.status, "video job deleted");
        Ok(reply.status)
    }
}

fn describe_artifact(
    reference: &str,
    backend: BackendKind,
    bytes: Vec<u8>,
    content_type: Option<String>,
) -> Artifact {
    let declared = content_type
        .as_deref()
        .map(|value| value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value != "application/octet-stream");
    let is_video = declared
        .as_deref()
        .map(|value| value.starts_with("video/"))
        .unwrap_or(backend == BackendKind::Sora);

    let mut artifact = Artifact {
        source_url: reference.to_string(),
        kind: if is_video {
            MediaKind::Video
        } else {
            MediaKind::Image
        },
        mime_type: declared,
        width: None,
        height: None,
        has_transparency: None,
        size_bytes: bytes.len(),
        bytes: Vec::new(),
    };
    if is_video {
        if artifact.mime_type.is_none() {
            artifact.mime_type = Some("video/mp4".to_string());
        }
    } else {
        if artifact.mime_type.is_none() {
            artifact.mime_type = image::guess_format(&bytes)
                .ok()
                .map(|format| format.to_mime_type().to_string());
        }
        match image::load_from_memory(&bytes) {
            Ok(decoded) => {
                artifact.width = Some(decoded.width());
                artifact.height = Some(decoded.height());
                artifact.has_transparency = Some(
                    decoded.color().has_alpha()
                        && decoded.to_rgba8().pixels().any(|pixel| pixel[3] < 255),
                );
            }
            Err(err) => warn!(error = %err, "artifact is not a decodable image"),
        }
    }
    artifact.bytes = bytes;
    artifact
}

/// Base64 of a source image, as sent in `image_prompt`.
pub fn encode_image_prompt(image: &SourceImage) -> String {
    BASE64.encode(&image.bytes)
}

pub fn variant_of(model: &str) -> EngineResult<ModelVariant> {
    ModelVariant::parse(model).ok_or_else(|| GenerationError::InvalidModel {
        model: model.to_string(),
        expected: ModelVariant::known_names(),
    })
}
