use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collaborators::AnalysisReport;
use crate::models::GenerationParams;
use crate::tasks::{Artifact, TaskStatus};

pub const DEFAULT_PIPELINE_MODEL: &str = "flux-pro";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineAction {
    #[default]
    Generate,
    Edit,
}

impl PipelineAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineAction::Generate => "generate",
            PipelineAction::Edit => "edit",
        }
    }
}

/// Caller-supplied image bytes used as edit input or video attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl SourceImage {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read source image {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "image.png".to_string());
        Ok(Self::new(file_name, mime_for_path(path), bytes))
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("mp4") => "video/mp4",
        _ => "image/png",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveOptions {
    pub enabled: bool,
    pub save_all: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            save_all: true,
            destination_path: None,
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
}

/// Request accepted by the pipeline dispatcher. Generation parameters sit
/// at the top level next to the pipeline fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    #[serde(default)]
    pub action: PipelineAction,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(flatten)]
    pub params: GenerationParams,
    #[serde(skip)]
    pub source_images: Vec<SourceImage>,
    #[serde(default)]
    pub save_options: SaveOptions,
    #[serde(default)]
    pub analysis_options: AnalysisOptions,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_model() -> String {
    DEFAULT_PIPELINE_MODEL.to_string()
}

impl PipelineRequest {
    pub fn new(action: PipelineAction, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            action,
            model: model.into(),
            params: GenerationParams::new(prompt),
            source_images: Vec::new(),
            save_options: SaveOptions::default(),
            analysis_options: AnalysisOptions::default(),
            metadata: Map::new(),
        }
    }

    /// Request metadata overlaid with save-option metadata.
    pub fn merged_metadata(&self) -> Map<String, Value> {
        let mut merged = self.metadata.clone();
        for (key, value) in &self.save_options.metadata {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Generation,
    Save,
    Analysis,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Generation => "generation",
            PipelineStage::Save => "save",
            PipelineStage::Analysis => "analysis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: PipelineStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    pub artifacts: Vec<Artifact>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(skip_serializing)]
    pub request_payload: Option<Value>,
}

impl GenerationResult {
    pub fn failed(model: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            task_id: None,
            model: model.into(),
            status: None,
            artifacts: Vec::new(),
            error: Some(StageError {
                stage: PipelineStage::Generation,
                message: message.clone(),
            }),
            message,
            request_payload: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedArtifact {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveResult {
    pub success: bool,
    pub saved: Vec<SavedArtifact>,
    pub total_saved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl SaveResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            saved: Vec::new(),
            total_saved: 0,
            error: Some(StageError {
                stage: PipelineStage::Save,
                message: message.into(),
            }),
        }
    }
}

/// Analysis of one image artifact, keyed by its index in the generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAnalysis {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `report` mirrors the first successful entry of `images`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub success: bool,
    pub images: Vec<ImageAnalysis>,
    pub total_analyzed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl AnalysisResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(StageError {
                stage: PipelineStage::Analysis,
                message: message.into(),
            }),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub step: usize,
    pub stage: PipelineStage,
    pub success: bool,
    pub message: String,
}

/// Aggregated outcome of one pipeline run. Later stages are `None` when
/// they were not requested or could not run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResponse {
    pub success: bool,
    pub message: String,
    pub steps: Vec<StepSummary>,
    pub generation_result: GenerationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_result: Option<SaveResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<AnalysisResult>,
}

impl PipelineResponse {
    pub fn errors(&self) -> Vec<&StageError> {
        let mut out = Vec::new();
        if let Some(error) = &self.generation_result.error {
            out.push(error);
        }
        if let Some(error) = self.save_result.as_ref().and_then(|row| row.error.as_ref()) {
            out.push(error);
        }
        if let Some(error) = self
            .analysis_result
            .as_ref()
            .and_then(|row| row.error.as_ref())
        {
            out.push(error);
        }
        out
    }
}
