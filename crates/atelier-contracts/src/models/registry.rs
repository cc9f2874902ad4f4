use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// External provider that owns a model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Flux,
    Sora,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Flux => "flux",
            BackendKind::Sora => "sora",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "flux" | "image" | "bfl" => Some(BackendKind::Flux),
            "sora" | "video" => Some(BackendKind::Sora),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelVariant {
    #[serde(rename = "flux-pro")]
    ImagePro,
    #[serde(rename = "flux-pro-ultra")]
    ImageProUltra,
    #[serde(rename = "flux-kontext")]
    ImageEdit,
    #[serde(rename = "sora")]
    Video,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 4] = [
        ModelVariant::ImagePro,
        ModelVariant::ImageProUltra,
        ModelVariant::ImageEdit,
        ModelVariant::Video,
    ];

    /// Wire name, also the endpoint suffix on the image backend.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelVariant::ImagePro => "flux-pro",
            ModelVariant::ImageProUltra => "flux-pro-ultra",
            ModelVariant::ImageEdit => "flux-kontext",
            ModelVariant::Video => "sora",
        }
    }

    /// Accepts wire names and the generic `image-*`/`video` aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "flux-pro" | "image-pro" => Some(ModelVariant::ImagePro),
            "flux-pro-ultra" | "image-pro-ultra" => Some(ModelVariant::ImageProUltra),
            "flux-kontext" | "image-edit" => Some(ModelVariant::ImageEdit),
            "sora" | "video" => Some(ModelVariant::Video),
            _ => None,
        }
    }

    pub fn backend(self) -> BackendKind {
        match self {
            ModelVariant::Video => BackendKind::Sora,
            _ => BackendKind::Flux,
        }
    }

    pub fn is_video(self) -> bool {
        self.backend() == BackendKind::Sora
    }

    pub fn known_names() -> String {
        Self::ALL
            .iter()
            .map(|variant| variant.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub variant: ModelVariant,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    pub fn backend(&self) -> BackendKind {
        self.variant.backend()
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    /// Looks a model up by wire name or alias.
    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        if let Some(model) = self.models.get(name) {
            return Some(model);
        }
        let variant = ModelVariant::parse(name)?;
        self.models.values().find(|model| model.variant == variant)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |variant: ModelVariant, capabilities: &[&str]| {
        map.insert(
            variant.as_str().to_string(),
            ModelSpec {
                name: variant.as_str().to_string(),
                variant,
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert(ModelVariant::ImagePro, &["image"]);
    insert(ModelVariant::ImageProUltra, &["image", "image_prompt"]);
    insert(ModelVariant::ImageEdit, &["image", "edit", "image_prompt"]);
    insert(ModelVariant::Video, &["video", "edit", "inpaint"]);

    map
}
