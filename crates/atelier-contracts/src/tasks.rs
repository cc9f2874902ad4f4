use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{BackendKind, ModelVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Submitted,
    Polling,
    Ready,
    Error,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Ready | TaskStatus::Error | TaskStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Submitted => "Submitted",
            TaskStatus::Polling => "Polling",
            TaskStatus::Ready => "Ready",
            TaskStatus::Error => "Error",
            TaskStatus::TimedOut => "TimedOut",
        }
    }
}

/// Enough to find a task again on its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub backend: BackendKind,
    pub id: String,
}

/// One normalized status read. `status` is `Ready`, `Error` or `Polling`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub raw_status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub result_refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Downloaded output of a ready task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub source_url: String,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_transparency: Option<bool>,
    pub size_bytes: usize,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn extension(&self) -> &'static str {
        let mime = self.mime_type.as_deref().unwrap_or_default().to_ascii_lowercase();
        if mime.contains("png") {
            return "png";
        }
        if mime.contains("webp") {
            return "webp";
        }
        if mime.contains("jpeg") || mime.contains("jpg") {
            return "jpg";
        }
        match self.kind {
            MediaKind::Video => "mp4",
            MediaKind::Image => "png",
        }
    }
}

/// One backend job from submission to terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationTask {
    pub id: String,
    pub model: ModelVariant,
    pub status: TaskStatus,
    pub payload: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub result_refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl GenerationTask {
    pub fn submitted(id: impl Into<String>, model: ModelVariant, payload: Value) -> Self {
        Self {
            id: id.into(),
            model,
            status: TaskStatus::Submitted,
            payload,
            result_refs: Vec::new(),
            error_detail: None,
            artifacts: Vec::new(),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            backend: self.model.backend(),
            id: self.id.clone(),
        }
    }

    pub fn begin_polling(&mut self) {
        if self.status == TaskStatus::Submitted {
            self.status = TaskStatus::Polling;
        }
    }

    /// Applies a status read. Terminal tasks are left untouched.
    pub fn apply_snapshot(&mut self, snapshot: &StatusSnapshot) {
        if self.status.is_terminal() {
            return;
        }
        match snapshot.status {
            TaskStatus::Ready => {
                self.status = TaskStatus::Ready;
                self.result_refs = snapshot.result_refs.clone();
            }
            TaskStatus::Error => {
                self.status = TaskStatus::Error;
                self.error_detail = Some(
                    snapshot
                        .error_detail
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string()),
                );
            }
            _ => self.status = TaskStatus::Polling,
        }
    }

    pub fn mark_failed(&mut self, detail: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Error;
        self.error_detail = Some(detail.into());
    }

    pub fn mark_timed_out(&mut self, detail: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::TimedOut;
        self.error_detail = Some(detail.into());
    }

    pub fn primary_ref(&self) -> Option<&str> {
        self.result_refs.first().map(String::as_str)
    }
}
