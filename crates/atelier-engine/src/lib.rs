//! Job coordination for the image and video generation backends: payload
//! shaping, submission, polling, artifact download and the pipeline that
//! chains generation, save and analysis.

pub mod analysis;
pub mod backends;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod payload;
pub mod pipeline;
pub mod poller;
pub mod storage;
pub mod submitter;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use serde_json::Value;
use sha2::{Digest, Sha256};

pub use analysis::{ChatVisionAnalyzer, DEFAULT_ANALYSIS_PROMPT};
pub use backends::{BackendEndpoints, BackendSet, FluxBackend, JobListQuery, SoraBackend};
pub use config::{EngineConfig, PollPolicy};
pub use coordinator::GenerationCoordinator;
pub use error::{EngineResult, GenerationError};
pub use payload::{build_payload, BuiltPayload};
pub use pipeline::PipelineDispatcher;
pub use poller::{JobPoller, StatusReader, StatusSource, TerminalStatus};
pub use storage::LocalDirStorage;
pub use submitter::{JobSubmitter, Submission};
pub use transport::{BackendTransport, HttpReply, HttpRequest, ReqwestTransport};

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
pub(crate) fn map_object(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn json_value_to_form_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(raw) => raw.to_string(),
        Value::Number(raw) => raw.to_string(),
        Value::String(raw) => raw.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

pub(crate) fn normalize_flux_output_format_option(raw: &str) -> Option<&'static str> {
    let mut lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return None;
    }
    if let Some(value) = lowered.strip_prefix("image/") {
        lowered = value.to_string();
    }
    match lowered.as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpeg"),
        _ => None,
    }
}
