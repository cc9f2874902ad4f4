use std::path::Path;

use serde_json::{Map, Value};

use crate::events::now_utc_iso;
use crate::pipeline::{PipelineRequest, PipelineResponse};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Receipt for one pipeline run. Secrets and inline image data are
/// replaced with `<omitted>`.
pub fn build_pipeline_receipt(
    run_id: &str,
    request: &PipelineRequest,
    response: &PipelineResponse,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert("run_id".to_string(), Value::String(run_id.to_string()));
    root.insert("written_at".to_string(), Value::String(now_utc_iso()));
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "source_images".to_string(),
        Value::Array(
            request
                .source_images
                .iter()
                .map(|image| Value::String(image.file_name.clone()))
                .collect(),
        ),
    );
    root.insert(
        "backend_request".to_string(),
        sanitize_payload(
            response
                .generation_result
                .request_payload
                .as_ref()
                .unwrap_or(&Value::Null),
        ),
    );
    root.insert(
        "response".to_string(),
        sanitize_payload(&serde_json::to_value(response).unwrap_or(Value::Null)),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "b64_json" | "image_prompt" | "data" | "bytes" | "webhook_secret"
                ) && !row.is_null()
                {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{build_pipeline_receipt, sanitize_payload, write_receipt};
    use crate::pipeline::{
        GenerationResult, PipelineAction, PipelineRequest, PipelineResponse, SourceImage,
    };

    #[test]
    fn sanitize_hides_inline_images_and_secrets() {
        let sanitized = sanitize_payload(&json!({
            "prompt": "cat",
            "image_prompt": "aGVsbG8=",
            "webhook_secret": "s3cret",
            "nested": [{"b64_json": "abc", "keep": 1}],
        }));
        assert_eq!(sanitized["prompt"], json!("cat"));
        assert_eq!(sanitized["image_prompt"], json!("<omitted>"));
        assert_eq!(sanitized["webhook_secret"], json!("<omitted>"));
        assert_eq!(sanitized["nested"][0]["b64_json"], json!("<omitted>"));
        assert_eq!(sanitized["nested"][0]["keep"], json!(1));
    }

    #[test]
    fn receipt_round_trips_to_disk() -> anyhow::Result<()> {
        let mut request = PipelineRequest::new(PipelineAction::Edit, "flux-kontext", "hat");
        request.params.image_prompt = Some("aGVsbG8=".to_string());
        request
            .source_images
            .push(SourceImage::new("ref.png", "image/png", vec![1, 2, 3]));
        let mut generation = GenerationResult::failed("flux-kontext", "boom");
        generation.request_payload = Some(json!({"prompt": "hat", "image_prompt": "aGVsbG8="}));
        let response = PipelineResponse {
            success: false,
            message: "Pipeline completed with issues".to_string(),
            steps: Vec::new(),
            generation_result: generation,
            save_result: None,
            analysis_result: None,
        };

        let receipt = build_pipeline_receipt("run-1", &request, &response);
        assert_eq!(receipt["request"]["image_prompt"], json!("<omitted>"));
        assert_eq!(receipt["backend_request"]["image_prompt"], json!("<omitted>"));
        assert_eq!(receipt["source_images"], json!(["ref.png"]));
        assert_eq!(receipt["response"]["success"], json!(false));

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("receipts").join("receipt-run-1.json");
        write_receipt(&path, &receipt)?;
        let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(parsed, receipt);
        Ok(())
    }
}
