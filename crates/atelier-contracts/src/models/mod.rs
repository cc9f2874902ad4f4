mod params;
mod registry;
mod selectors;

pub use params::GenerationParams;
pub use registry::{BackendKind, ModelRegistry, ModelSpec, ModelVariant};
pub use selectors::{EditRoute, EditRouter};
