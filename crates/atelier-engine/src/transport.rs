use std::time::Duration;

use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use atelier_contracts::collaborators::AuthHeaders;

use crate::error::{EngineResult, GenerationError};
use crate::truncate_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Multipart body kept as plain data so it can be encoded again for every
/// attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartBody {
    pub fields: Vec<(String, String)>,
    pub files: Vec<FilePart>,
}

impl MultipartBody {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: AuthHeaders,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, headers: AuthHeaders) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers,
            body: RequestBody::Empty,
        }
    }

    pub fn delete(url: impl Into<String>, headers: AuthHeaders) -> Self {
        Self {
            method: HttpMethod::Delete,
            url: url.into(),
            headers,
            body: RequestBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>, headers: AuthHeaders, body: RequestBody) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// Parses a successful reply as JSON. Non-2xx replies become
    /// `SubmissionRejected` with the truncated body.
    pub fn json(&self, context: &str) -> EngineResult<Value> {
        if !self.is_success() {
            return Err(GenerationError::rejected(self.status, &self.text()));
        }
        if self.body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body).map_err(|err| GenerationError::InvalidResponse {
            context: context.to_string(),
            message: format!("{err}: {}", truncate_text(&self.text(), 512)),
        })
    }
}

/// The single seam between the engine and the network.
pub trait BackendTransport: Send + Sync {
    fn send(&self, request: HttpRequest) -> EngineResult<HttpReply>;
}

/// Blocking reqwest transport. One client is built at startup and shared.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: HttpClient,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(),
            timeout,
        }
    }

    fn encode_form(body: &MultipartBody) -> EngineResult<MultipartForm> {
        let mut form = MultipartForm::new();
        for (key, value) in &body.fields {
            form = form.text(key.clone(), value.clone());
        }
        for file in &body.files {
            let part = MultipartPart::bytes(file.bytes.clone())
                .file_name(file.file_name.clone())
                .mime_str(&file.mime_type)
                .map_err(|err| GenerationError::Transport {
                    context: "multipart".to_string(),
                    message: format!("invalid mime '{}': {err}", file.mime_type),
                })?;
            form = form.part(file.field.clone(), part);
        }
        Ok(form)
    }
}

impl BackendTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> EngineResult<HttpReply> {
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&request.url),
            HttpMethod::Post => self.http.post(&request.url),
            HttpMethod::Delete => self.http.delete(&request.url),
        }
        .timeout(self.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(payload) => builder
                .header("accept", "application/json")
                .json(payload),
            RequestBody::Multipart(body) => builder.multipart(Self::encode_form(body)?),
        };

        let context = format!("{} {}", request.method.as_str(), request.url);
        let response = builder.send().map_err(|err| GenerationError::Transport {
            context: context.clone(),
            message: err.to_string(),
        })?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|err| GenerationError::Transport {
                context,
                message: format!("response body read failed: {err}"),
            })?
            .to_vec();
        Ok(HttpReply {
            status,
            content_type,
            body,
        })
    }
}
