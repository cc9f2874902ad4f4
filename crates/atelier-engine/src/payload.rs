use serde_json::{json, Map, Value};
use tracing::warn;

use atelier_contracts::models::{GenerationParams, ModelVariant};

use crate::error::{EngineResult, GenerationError};
use crate::normalize_flux_output_format_option;

const DEFAULT_SIZE: u32 = 1024;
const DEFAULT_SAFETY_TOLERANCE: i64 = 2;
const DEFAULT_OUTPUT_FORMAT: &str = "jpeg";
const DEFAULT_ASPECT_RATIO: &str = "16:9";
const DEFAULT_IMAGE_PROMPT_STRENGTH: f64 = 0.1;
const DEFAULT_VIDEO_SECONDS: u32 = 5;
const DEFAULT_VIDEO_SIZE: u32 = 480;

/// Field set of one model variant. Absent optionals are emitted as `null`
/// and stripped by [`build_payload`].
pub trait VariantShape: Sync {
    fn variant(&self) -> ModelVariant;

    /// Fields that must survive null stripping.
    fn required(&self) -> &'static [&'static str] {
        &["prompt"]
    }

    fn shape(&self, params: &GenerationParams) -> Map<String, Value>;
}

struct ImageProShape;
struct ImageProUltraShape;
struct ImageEditShape;
struct VideoShape;

impl VariantShape for ImageProShape {
    fn variant(&self) -> ModelVariant {
        ModelVariant::ImagePro
    }

    fn shape(&self, params: &GenerationParams) -> Map<String, Value> {
        let mut body = flux_common(params);
        body.insert("width".to_string(), json!(params.width.unwrap_or(DEFAULT_SIZE)));
        body.insert("height".to_string(), json!(params.height.unwrap_or(DEFAULT_SIZE)));
        body
    }
}

impl VariantShape for ImageProUltraShape {
    fn variant(&self) -> ModelVariant {
        ModelVariant::ImageProUltra
    }

    fn shape(&self, params: &GenerationParams) -> Map<String, Value> {
        let mut body = flux_common(params);
        body.insert(
            "aspect_ratio".to_string(),
            json!(params
                .aspect_ratio
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(DEFAULT_ASPECT_RATIO)),
        );
        body.insert("raw".to_string(), json!(params.raw.unwrap_or(false)));
        insert_image_prompt(&mut body, params);
        body
    }
}

impl VariantShape for ImageEditShape {
    fn variant(&self) -> ModelVariant {
        ModelVariant::ImageEdit
    }

    fn required(&self) -> &'static [&'static str] {
        &["prompt", "image_prompt"]
    }

    fn shape(&self, params: &GenerationParams) -> Map<String, Value> {
        let mut body = flux_common(params);
        body.insert("width".to_string(), json!(params.width.unwrap_or(DEFAULT_SIZE)));
        body.insert("height".to_string(), json!(params.height.unwrap_or(DEFAULT_SIZE)));
        insert_image_prompt(&mut body, params);
        body
    }
}

impl VariantShape for VideoShape {
    fn variant(&self) -> ModelVariant {
        ModelVariant::Video
    }

    fn shape(&self, params: &GenerationParams) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("prompt".to_string(), json!(params.prompt.trim()));
        body.insert(
            "n_seconds".to_string(),
            json!(params.n_seconds.unwrap_or(DEFAULT_VIDEO_SECONDS)),
        );
        body.insert(
            "height".to_string(),
            json!(params.height.unwrap_or(DEFAULT_VIDEO_SIZE)),
        );
        body.insert(
            "width".to_string(),
            json!(params.width.unwrap_or(DEFAULT_VIDEO_SIZE)),
        );
        body.insert(
            "n_variants".to_string(),
            json!(params.n_variants.unwrap_or(1).max(1)),
        );
        body
    }
}

static SHAPES: [&dyn VariantShape; 4] = [
    &ImageProShape,
    &ImageProUltraShape,
    &ImageEditShape,
    &VideoShape,
];

pub fn shape_for(variant: ModelVariant) -> &'static dyn VariantShape {
    match variant {
        ModelVariant::ImagePro => SHAPES[0],
        ModelVariant::ImageProUltra => SHAPES[1],
        ModelVariant::ImageEdit => SHAPES[2],
        ModelVariant::Video => SHAPES[3],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPayload {
    pub variant: ModelVariant,
    pub body: Map<String, Value>,
}

/// Maps a model name and parameter bag to the wire payload. Pure.
pub fn build_payload(model: &str, params: &GenerationParams) -> EngineResult<BuiltPayload> {
    let variant = ModelVariant::parse(model).ok_or_else(|| GenerationError::InvalidModel {
        model: model.to_string(),
        expected: ModelVariant::known_names(),
    })?;
    let shape = shape_for(variant);
    let mut body = shape.shape(params);
    body.retain(|_, value| !is_absent(value));

    for field in shape.required() {
        if !body.contains_key(*field) {
            return Err(GenerationError::MissingRequiredField {
                model: variant.as_str().to_string(),
                field: (*field).to_string(),
            });
        }
    }
    Ok(BuiltPayload { variant, body })
}

fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

fn flux_common(params: &GenerationParams) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("prompt".to_string(), json!(params.prompt.trim()));
    body.insert(
        "prompt_upsampling".to_string(),
        json!(params.prompt_upsampling.unwrap_or(false)),
    );
    body.insert("seed".to_string(), json!(params.seed));
    body.insert(
        "safety_tolerance".to_string(),
        json!(clamp_safety_tolerance(params.safety_tolerance)),
    );
    body.insert(
        "output_format".to_string(),
        json!(flux_output_format(params.output_format.as_deref())),
    );
    body.insert("webhook_url".to_string(), json!(params.webhook_url));
    body.insert("webhook_secret".to_string(), json!(params.webhook_secret));
    body
}

fn insert_image_prompt(body: &mut Map<String, Value>, params: &GenerationParams) {
    body.insert("image_prompt".to_string(), json!(params.image_prompt));
    let strength = params
        .image_prompt_strength
        .unwrap_or(DEFAULT_IMAGE_PROMPT_STRENGTH);
    let clamped = strength.clamp(0.0, 1.0);
    if clamped != strength {
        warn!(strength, clamped, "image_prompt_strength out of range; clamping");
    }
    body.insert("image_prompt_strength".to_string(), json!(clamped));
}

fn clamp_safety_tolerance(raw: Option<i64>) -> i64 {
    let value = raw.unwrap_or(DEFAULT_SAFETY_TOLERANCE);
    let clamped = value.clamp(0, 6);
    if clamped != value {
        warn!(value, clamped, "safety_tolerance out of range; clamping");
    }
    clamped
}

fn flux_output_format(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return DEFAULT_OUTPUT_FORMAT;
    };
    normalize_flux_output_format_option(raw).unwrap_or_else(|| {
        warn!(output_format = raw, "unsupported output_format; using jpeg");
        DEFAULT_OUTPUT_FORMAT
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use atelier_contracts::models::{GenerationParams, ModelVariant};

    use super::build_payload;
    use crate::error::GenerationError;

    #[test]
    fn no_variant_emits_null_or_empty_values() -> anyhow::Result<()> {
        let mut params = GenerationParams::new("a lighthouse at dusk");
        params.image_prompt = Some("aGVsbG8=".to_string());
        params.output_format = Some(String::new());
        for variant in ModelVariant::ALL {
            let built = build_payload(variant.as_str(), &params)?;
            assert_eq!(built.variant, variant);
            for (key, value) in &built.body {
                assert!(!value.is_null(), "{variant}: {key} is null");
                assert_ne!(value, &Value::String(String::new()), "{variant}: {key} empty");
            }
            assert!(!built.body.contains_key("seed"));
            assert!(!built.body.contains_key("webhook_url"));
        }
        Ok(())
    }

    #[test]
    fn defaults_follow_variant() -> anyhow::Result<()> {
        let params = GenerationParams::new("cat");
        let pro = build_payload("image-pro", &params)?.body;
        assert_eq!(pro["width"], json!(1024));
        assert_eq!(pro["safety_tolerance"], json!(2));
        assert_eq!(pro["output_format"], json!("jpeg"));
        assert_eq!(pro["prompt_upsampling"], json!(false));
        assert!(!pro.contains_key("aspect_ratio"));

        let ultra = build_payload("flux-pro-ultra", &params)?.body;
        assert_eq!(ultra["aspect_ratio"], json!("16:9"));
        assert_eq!(ultra["raw"], json!(false));
        assert!(!ultra.contains_key("width"));
        assert!(!ultra.contains_key("image_prompt"));

        let video = build_payload("sora", &params)?.body;
        assert_eq!(
            Value::Object(video),
            json!({"prompt": "cat", "n_seconds": 5, "height": 480, "width": 480, "n_variants": 1})
        );
        Ok(())
    }

    #[test]
    fn mandatory_fields_are_enforced() {
        let params = GenerationParams::new("add a hat");
        assert_eq!(
            build_payload("flux-kontext", &params),
            Err(GenerationError::MissingRequiredField {
                model: "flux-kontext".to_string(),
                field: "image_prompt".to_string(),
            })
        );
        for variant in ModelVariant::ALL {
            let result = build_payload(variant.as_str(), &GenerationParams::new("  "));
            assert!(matches!(
                result,
                Err(GenerationError::MissingRequiredField { ref field, .. }) if field == "prompt"
            ));
        }
    }

    #[test]
    fn unknown_model_and_clamping() -> anyhow::Result<()> {
        assert!(matches!(
            build_payload("dall-e", &GenerationParams::new("cat")),
            Err(GenerationError::InvalidModel { .. })
        ));

        let mut params = GenerationParams::new("cat");
        params.safety_tolerance = Some(9);
        params.image_prompt_strength = Some(1.5);
        params.output_format = Some("PNG".to_string());
        let ultra = build_payload("image-pro-ultra", &params)?.body;
        assert_eq!(ultra["safety_tolerance"], json!(6));
        assert_eq!(ultra["image_prompt_strength"], json!(1.0));
        assert_eq!(ultra["output_format"], json!("png"));
        Ok(())
    }
}
