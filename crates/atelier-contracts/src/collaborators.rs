use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type AuthHeaders = BTreeMap<String, String>;

/// Supplies request headers for a backend.
pub trait CredentialProvider: Send + Sync {
    fn auth_headers(&self) -> anyhow::Result<AuthHeaders>;
}

/// Durable home for generated bytes. Returns the stored object's URL.
pub trait ObjectStorage: Send + Sync {
    fn upload(&self, bytes: &[u8], path: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MetadataRecord {
    pub fn tags(&self) -> Vec<String> {
        self.fields
            .get("tags")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Records describing saved artifacts.
pub trait MetadataStore: Send + Sync {
    fn create_record(&self, fields: Map<String, Value>) -> anyhow::Result<String>;
    fn query_records(&self, filter: &Map<String, Value>) -> anyhow::Result<Vec<MetadataRecord>>;
    /// Merges `fields` into an existing record. Returns false when `id` is unknown.
    fn update_record(&self, id: &str, fields: Map<String, Value>) -> anyhow::Result<bool>;
    fn delete_record(&self, id: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub description: String,
    pub products: String,
    pub tags: Vec<String>,
    pub feedback: String,
}

impl AnalysisReport {
    /// Reads a report from loosely shaped model output. Missing fields
    /// become empty; `products` and `tags` accept either a string or a list.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| match value.get(key) {
            Some(Value::String(text)) => text.trim().to_string(),
            Some(Value::Array(rows)) => rows
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let tags = match value.get("tags") {
            Some(Value::Array(rows)) => rows
                .iter()
                .filter_map(Value::as_str)
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect(),
            Some(Value::String(raw)) => raw
                .split(',')
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect(),
            _ => Vec::new(),
        };
        Self {
            description: text("description"),
            products: text("products"),
            tags,
            feedback: text("feedback"),
        }
    }
}

/// Describes one image; `image_b64` is the base64 of the image bytes.
pub trait VisionAnalyzer: Send + Sync {
    fn analyze(&self, image_b64: &str, prompt: &str) -> anyhow::Result<AnalysisReport>;
}
