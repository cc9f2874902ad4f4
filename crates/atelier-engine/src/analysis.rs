use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tracing::debug;

use atelier_contracts::collaborators::{AnalysisReport, AuthHeaders, VisionAnalyzer};

use crate::config::AnalyzerSettings;
use crate::transport::{BackendTransport, HttpRequest, RequestBody};

pub const DEFAULT_ANALYSIS_PROMPT: &str = "You are a creative director reviewing a generated image. \
Respond with a JSON object with these keys: \
\"description\" (two or three sentences describing the image), \
\"products\" (products or brands visible, or \"None identified\"), \
\"tags\" (an array of up to ten short lowercase keywords) and \
\"feedback\" (one paragraph on how the image could be improved).";

/// Vision analysis through an Azure OpenAI chat completions deployment.
pub struct ChatVisionAnalyzer {
    transport: Arc<dyn BackendTransport>,
    settings: AnalyzerSettings,
}

impl ChatVisionAnalyzer {
    pub fn new(transport: Arc<dyn BackendTransport>, settings: AnalyzerSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    fn request_body(image_b64: &str, prompt: &str) -> Value {
        json!({
            "messages": [
                {"role": "system", "content": prompt},
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "Analyze this image."},
                        {
                            "type": "image_url",
                            "image_url": {"url": format!("data:image/png;base64,{image_b64}")}
                        }
                    ]
                }
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0
        })
    }
}

impl VisionAnalyzer for ChatVisionAnalyzer {
    fn analyze(&self, image_b64: &str, prompt: &str) -> anyhow::Result<AnalysisReport> {
        let mut headers = AuthHeaders::new();
        headers.insert("api-key".to_string(), self.settings.api_key.clone());
        let reply = self.transport.send(HttpRequest::post(
            self.settings.chat_url(),
            headers,
            RequestBody::Json(Self::request_body(image_b64, prompt)),
        ))?;
        if !reply.is_success() {
            bail!(
                "vision analysis request failed ({}): {}",
                reply.status,
                crate::truncate_text(&reply.text(), 512)
            );
        }
        let payload: Value =
            serde_json::from_slice(&reply.body).context("vision analysis returned invalid JSON")?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .context("vision analysis response missing message content")?;
        debug!(chars = content.len(), "vision analysis received");
        let parsed: Value = serde_json::from_str(strip_code_fence(content))
            .context("vision analysis content is not a JSON object")?;
        if !parsed.is_object() {
            bail!("vision analysis content is not a JSON object");
        }
        Ok(AnalysisReport::from_value(&parsed))
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
