use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context};
use serde_json::{Map, Value};

use crate::collaborators::{MetadataRecord, MetadataStore};
use crate::events::now_utc_iso;

/// Metadata store backed by a single JSON object file keyed by record id.
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_records<T>(
        &self,
        apply: impl FnOnce(&mut Map<String, Value>) -> (T, bool),
    ) -> anyhow::Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("record store lock poisoned"))?;
        let mut records = read_json_object(&self.path)?;
        let (out, dirty) = apply(&mut records);
        if dirty {
            write_json_object(&self.path, &records)?;
        }
        Ok(out)
    }
}

impl MetadataStore for FileRecordStore {
    fn create_record(&self, mut fields: Map<String, Value>) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        fields
            .entry("created_at")
            .or_insert_with(|| Value::String(now_utc_iso()));
        fields.remove("id");
        self.with_records(|records| {
            records.insert(id.clone(), Value::Object(fields));
            ((), true)
        })?;
        Ok(id)
    }

    /// Records whose fields equal every filter entry, newest first.
    fn query_records(&self, filter: &Map<String, Value>) -> anyhow::Result<Vec<MetadataRecord>> {
        let mut rows = self.with_records(|records| {
            let rows: Vec<MetadataRecord> = records
                .iter()
                .filter_map(|(id, value)| {
                    let fields = value.as_object()?;
                    let matches = filter
                        .iter()
                        .all(|(key, wanted)| fields.get(key) == Some(wanted));
                    matches.then(|| MetadataRecord {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                })
                .collect();
            (rows, false)
        })?;
        rows.sort_by(|left, right| created_at(right).cmp(created_at(left)));
        Ok(rows)
    }

    fn update_record(&self, id: &str, fields: Map<String, Value>) -> anyhow::Result<bool> {
        self.with_records(|records| {
            let Some(Value::Object(existing)) = records.get_mut(id) else {
                return (false, false);
            };
            existing.extend(fields.into_iter().filter(|(key, _)| key != "id"));
            existing.insert("updated_at".to_string(), Value::String(now_utc_iso()));
            (true, true)
        })
    }

    fn delete_record(&self, id: &str) -> anyhow::Result<bool> {
        self.with_records(|records| {
            let removed = records.remove(id).is_some();
            (removed, removed)
        })
    }
}

fn created_at(record: &MetadataRecord) -> &str {
    record
        .fields
        .get("created_at")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// A missing file is an empty store; anything unreadable is an error so a
/// later write never replaces records it could not parse.
fn read_json_object(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("record store {} is not valid JSON", path.display()))?;
    match parsed {
        Value::Object(records) => Ok(records),
        _ => bail!("record store {} is not a JSON object", path.display()),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
