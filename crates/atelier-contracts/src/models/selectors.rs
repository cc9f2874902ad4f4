use super::registry::{ModelRegistry, ModelVariant};

const EDIT_CAPABILITY: &str = "edit";

/// Where an edit request ends up. `fallback_reason` is set when the
/// requested model cannot take source images and another one was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRoute {
    pub requested: ModelVariant,
    pub variant: ModelVariant,
    pub fallback_reason: Option<String>,
}

impl EditRoute {
    pub fn rerouted(&self) -> bool {
        self.requested != self.variant
    }
}

/// Routes requests that carry source images to a model able to edit them.
///
/// A model that cannot edit is swapped for the first edit-capable model on
/// the same backend, then for any edit-capable model in registry order.
#[derive(Debug, Clone)]
pub struct EditRouter {
    registry: ModelRegistry,
}

impl Default for EditRouter {
    fn default() -> Self {
        Self::new(ModelRegistry::new(None))
    }
}

impl EditRouter {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn route(&self, requested: ModelVariant) -> Result<EditRoute, String> {
        if self
            .registry
            .ensure(requested.as_str(), EDIT_CAPABILITY)
            .is_some()
        {
            return Ok(EditRoute {
                requested,
                variant: requested,
                fallback_reason: None,
            });
        }

        let candidates = self.registry.by_capability(EDIT_CAPABILITY);
        let chosen = candidates
            .iter()
            .find(|spec| spec.backend() == requested.backend())
            .or_else(|| candidates.first())
            .map(|spec| spec.variant)
            .ok_or_else(|| format!("no registered model can edit images (requested '{requested}')"))?;
        Ok(EditRoute {
            requested,
            variant: chosen,
            fallback_reason: Some(format!("'{requested}' cannot edit images; routed to '{chosen}'.")),
        })
    }
}
