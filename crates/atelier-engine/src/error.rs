use std::time::Duration;

use thiserror::Error;

use crate::truncate_text;

pub type EngineResult<T> = Result<T, GenerationError>;

/// Failures raised by payload building, submission, polling and artifact
/// download. The pipeline turns these into per-stage messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("unknown model '{model}' (expected one of: {expected})")]
    InvalidModel { model: String, expected: String },
    #[error("missing required field '{field}' for {model}")]
    MissingRequiredField { model: String, field: String },
    #[error("submission rejected ({status_code}): {body}")]
    SubmissionRejected { status_code: u16, body: String },
    #[error("submission response did not include a task id")]
    NoTaskId,
    #[error("backend reported an error: {detail}")]
    BackendError { detail: String },
    #[error("task did not finish within {:.1}s", .elapsed.as_secs_f64())]
    TimedOut { elapsed: Duration },
    #[error("artifact download failed ({url}): {reason}")]
    ArtifactFetchFailed { url: String, reason: String },
    #[error("save failed: {cause}")]
    SaveFailed { cause: String },
    #[error("analysis failed: {cause}")]
    AnalysisFailed { cause: String },
    #[error("{context} request failed: {message}")]
    Transport { context: String, message: String },
    #[error("{context} returned an unexpected response: {message}")]
    InvalidResponse { context: String, message: String },
}

impl GenerationError {
    pub fn rejected(status_code: u16, body: &str) -> Self {
        Self::SubmissionRejected {
            status_code,
            body: truncate_text(body, 512),
        }
    }

    pub fn save(cause: impl std::fmt::Display) -> Self {
        Self::SaveFailed {
            cause: format!("{cause:#}"),
        }
    }

    pub fn analysis(cause: impl std::fmt::Display) -> Self {
        Self::AnalysisFailed {
            cause: format!("{cause:#}"),
        }
    }

    /// Short machine-friendly name used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidModel { .. } => "invalid_model",
            Self::MissingRequiredField { .. } => "missing_required_field",
            Self::SubmissionRejected { .. } => "submission_rejected",
            Self::NoTaskId => "no_task_id",
            Self::BackendError { .. } => "backend_error",
            Self::TimedOut { .. } => "timed_out",
            Self::ArtifactFetchFailed { .. } => "artifact_fetch_failed",
            Self::SaveFailed { .. } => "save_failed",
            Self::AnalysisFailed { .. } => "analysis_failed",
            Self::Transport { .. } => "transport",
            Self::InvalidResponse { .. } => "invalid_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::GenerationError;

    #[test]
    fn rejection_body_is_truncated() {
        let body = "x".repeat(2000);
        let GenerationError::SubmissionRejected { status_code, body } =
            GenerationError::rejected(400, &body)
        else {
            panic!("expected rejection");
        };
        assert_eq!(status_code, 400);
        assert_eq!(body.chars().count(), 513);
    }

    #[test]
    fn messages_are_readable() {
        let err = GenerationError::BackendError {
            detail: "unsafe content".to_string(),
        };
        assert_eq!(err.to_string(), "backend reported an error: unsafe content");
        let err = GenerationError::TimedOut {
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "task did not finish within 1.5s");
        assert_eq!(err.kind(), "timed_out");
        let err = GenerationError::save(anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "save failed: disk full");
    }
}
