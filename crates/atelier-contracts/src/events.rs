use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::BackendKind;
use crate::pipeline::{PipelineAction, PipelineStage};

/// Milestones of one pipeline run, in the order they are written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        action: PipelineAction,
        model: String,
        source_images: usize,
        save: bool,
        analyze: bool,
    },
    TaskSubmitted {
        task_id: String,
        model: String,
        backend: BackendKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        rerouted_from: Option<String>,
    },
    StageFinished {
        stage: PipelineStage,
        success: bool,
        message: String,
    },
    PipelineFinished {
        success: bool,
        task_id: Option<String>,
        elapsed_s: f64,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted { .. } => "pipeline_started",
            PipelineEvent::TaskSubmitted { .. } => "task_submitted",
            PipelineEvent::StageFinished { .. } => "stage_finished",
            PipelineEvent::PipelineFinished { .. } => "pipeline_finished",
        }
    }
}

/// Append-only `events.jsonl` log shared by every pipeline in a run.
/// Each line is one [`PipelineEvent`] stamped with `run_id` and `ts`.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: &PipelineEvent) -> anyhow::Result<Value> {
        let Value::Object(fields) = serde_json::to_value(event)? else {
            anyhow::bail!("event {} did not serialize to an object", event.kind());
        };
        let mut line = Map::new();
        line.insert("run_id".to_string(), Value::String(self.inner.run_id.clone()));
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        line.extend(fields);

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed to open {}", self.inner.path.display()))?;
        file.write_all(text.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
