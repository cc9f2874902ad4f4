use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use atelier_contracts::models::{BackendKind, ModelVariant};
use atelier_contracts::pipeline::SourceImage;

use crate::backends::{BackendEndpoints, BackendSet};
use crate::error::{EngineResult, GenerationError};
use crate::json_value_to_form_text;
use crate::transport::{
    BackendTransport, FilePart, HttpReply, HttpRequest, MultipartBody, RequestBody,
};

const ATTACHMENT_MIME: &str = "image/jpeg";

/// Accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub task_id: String,
    /// Body of the accepted attempt. Multipart jobs record their form
    /// fields, with `inpaint_items` decoded.
    pub payload: Value,
    pub attempts: u8,
}

pub struct JobSubmitter {
    transport: Arc<dyn BackendTransport>,
    backends: Arc<BackendSet>,
}

impl JobSubmitter {
    pub fn new(transport: Arc<dyn BackendTransport>, backends: Arc<BackendSet>) -> Self {
        Self {
            transport,
            backends,
        }
    }

    /// Sends one job. Video jobs with attachments go through the two-shape
    /// multipart attempt; everything else is a single JSON POST.
    pub fn submit(
        &self,
        variant: ModelVariant,
        payload: Map<String, Value>,
        attachments: &[SourceImage],
    ) -> EngineResult<Submission> {
        let backend = self.backends.endpoints(variant.backend())?;
        let payload = backend.prepare_payload(payload);
        if backend.kind() == BackendKind::Sora && !attachments.is_empty() {
            return self.submit_multipart(backend, variant, &payload, attachments);
        }
        if !attachments.is_empty() {
            warn!(
                model = variant.as_str(),
                count = attachments.len(),
                "attachments ignored for JSON submission"
            );
        }

        let request = HttpRequest::post(
            backend.submit_url(variant),
            backend.auth_headers()?,
            RequestBody::Json(Value::Object(payload.clone())),
        );
        let reply = self.transport.send(request)?;
        let task_id = accepted_task_id(backend, variant, &reply)?;
        info!(model = variant.as_str(), task_id = %task_id, "task submitted");
        Ok(Submission {
            task_id,
            payload: Value::Object(payload),
            attempts: 1,
        })
    }

    fn submit_multipart(
        &self,
        backend: &dyn BackendEndpoints,
        variant: ModelVariant,
        payload: &Map<String, Value>,
        attachments: &[SourceImage],
    ) -> EngineResult<Submission> {
        let url = backend.submit_url(variant);

        let first = multipart_body(payload, attachments, false);
        let reply = self.transport.send(HttpRequest::post(
            url.clone(),
            backend.auth_headers()?,
            RequestBody::Multipart(first.clone()),
        ))?;
        if reply.is_success() {
            let task_id = accepted_task_id(backend, variant, &reply)?;
            info!(model = variant.as_str(), task_id = %task_id, attempt = 1, "task submitted");
            return Ok(Submission {
                task_id,
                payload: multipart_manifest(&first),
                attempts: 1,
            });
        }

        warn!(
            model = variant.as_str(),
            status = reply.status,
            body = %crate::truncate_text(&reply.text(), 512),
            "submission without crop bounds rejected; retrying with full-frame crop bounds"
        );
        let second = multipart_body(payload, attachments, true);
        let reply = self.transport.send(HttpRequest::post(
            url,
            backend.auth_headers()?,
            RequestBody::Multipart(second.clone()),
        ))?;
        if !reply.is_success() {
            error!(
                model = variant.as_str(),
                status = reply.status,
                "submission with crop bounds rejected"
            );
        }
        let task_id = accepted_task_id(backend, variant, &reply)?;
        info!(model = variant.as_str(), task_id = %task_id, attempt = 2, "task submitted");
        Ok(Submission {
            task_id,
            payload: multipart_manifest(&second),
            attempts: 2,
        })
    }
}

fn accepted_task_id(
    backend: &dyn BackendEndpoints,
    variant: ModelVariant,
    reply: &HttpReply,
) -> EngineResult<String> {
    let body = reply.json(variant.as_str())?;
    backend.parse_task_id(&body).ok_or(GenerationError::NoTaskId)
}

/// One inpaint descriptor per attachment, all anchored at frame 0.
pub fn inpaint_items(attachments: &[SourceImage], with_crop_bounds: bool) -> Value {
    Value::Array(
        attachments
            .iter()
            .map(|image| {
                let mut item = json!({
                    "frame_index": 0,
                    "type": "image",
                    "file_name": image.file_name,
                });
                if with_crop_bounds {
                    item["crop_bounds"] = json!({
                        "left_fraction": 0.0,
                        "top_fraction": 0.0,
                        "right_fraction": 1.0,
                        "bottom_fraction": 1.0,
                    });
                }
                item
            })
            .collect(),
    )
}

fn multipart_body(
    payload: &Map<String, Value>,
    attachments: &[SourceImage],
    with_crop_bounds: bool,
) -> MultipartBody {
    let mut fields: Vec<(String, String)> = payload
        .iter()
        .map(|(key, value)| (key.clone(), json_value_to_form_text(value)))
        .collect();
    fields.push((
        "inpaint_items".to_string(),
        inpaint_items(attachments, with_crop_bounds).to_string(),
    ));
    let files = attachments
        .iter()
        .map(|image| FilePart {
            field: "files".to_string(),
            file_name: image.file_name.clone(),
            mime_type: ATTACHMENT_MIME.to_string(),
            bytes: image.bytes.clone(),
        })
        .collect();
    MultipartBody { fields, files }
}

fn multipart_manifest(body: &MultipartBody) -> Value {
    let mut manifest = Map::new();
    for (key, value) in &body.fields {
        let parsed = if key == "inpaint_items" {
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()))
        } else {
            Value::String(value.clone())
        };
        manifest.insert(key.clone(), parsed);
    }
    manifest.insert(
        "files".to_string(),
        Value::Array(
            body.files
                .iter()
                .map(|file| json!({"field": file.field, "file_name": file.file_name}))
                .collect(),
        ),
    );
    Value::Object(manifest)
}
