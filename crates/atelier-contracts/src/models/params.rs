use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Generation parameter bag. Which fields reach the wire depends on the
/// model variant; unset fields are never sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_upsampling: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_tolerance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prompt_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_variants: Option<u32>,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Sets one field from `key=value` command-line text.
    pub fn set(&mut self, key: &str, raw: &str) -> anyhow::Result<()> {
        let value = raw.trim();
        let text = || Some(value.to_string());
        match key.trim().to_ascii_lowercase().as_str() {
            "prompt" => self.prompt = value.to_string(),
            "width" => self.width = Some(parse_number(key, value)?),
            "height" => self.height = Some(parse_number(key, value)?),
            "aspect_ratio" => self.aspect_ratio = text(),
            "prompt_upsampling" => self.prompt_upsampling = Some(parse_bool(key, value)?),
            "seed" => self.seed = Some(parse_number(key, value)?),
            "safety_tolerance" => self.safety_tolerance = Some(parse_number(key, value)?),
            "output_format" => self.output_format = text(),
            "raw" => self.raw = Some(parse_bool(key, value)?),
            "image_prompt" => self.image_prompt = text(),
            "image_prompt_strength" => {
                self.image_prompt_strength = Some(parse_number(key, value)?)
            }
            "webhook_url" => self.webhook_url = text(),
            "webhook_secret" => self.webhook_secret = text(),
            "n_seconds" => self.n_seconds = Some(parse_number(key, value)?),
            "n_variants" => self.n_variants = Some(parse_number(key, value)?),
            other => bail!("unknown generation parameter '{other}'"),
        }
        Ok(())
    }
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("invalid value '{value}' for {key}"))
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid value '{value}' for {key}"),
    }
}
