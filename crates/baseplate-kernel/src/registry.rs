//! [`ModuleRegistry`] – ordered layers of module factories.
//!
//! Layers stand in for on-disk search roots: the embedding binary pushes a
//! user layer first, then the builtin layer, and discovery walks them in
//! that order. A name claimed by an earlier (higher-priority) layer shadows
//! any later candidate with the same name; two candidates with the same
//! name inside one layer are a hard configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use baseplate_types::PlateError;

use crate::module::{ModuleDescriptor, ModuleFactory};

/// One priority level of the registry: a named, ordered set of factories.
pub struct RegistryLayer {
    label: String,
    factories: Vec<Arc<dyn ModuleFactory>>,
}

impl RegistryLayer {
    /// `label` names the layer in logs and duplicate errors
    /// (e.g. "user", "builtin").
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            factories: Vec::new(),
        }
    }

    /// Add a factory. Registration order is discovery order within the
    /// layer and drives topological tie-breaking.
    pub fn register<F: ModuleFactory + 'static>(mut self, factory: F) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// A discovered module candidate: its descriptor, the factory that builds
/// it, and the layer that produced it.
#[derive(Clone)]
pub struct Candidate {
    pub descriptor: ModuleDescriptor,
    pub factory: Arc<dyn ModuleFactory>,
    pub layer: String,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("descriptor", &self.descriptor)
            .field("layer", &self.layer)
            .finish()
    }
}

/// Ordered collection of [`RegistryLayer`]s, highest priority first.
#[derive(Default)]
pub struct ModuleRegistry {
    layers: Vec<RegistryLayer>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer. Earlier layers take priority over later ones.
    pub fn push_layer(mut self, layer: RegistryLayer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Walk the layers in priority order and produce the post-override
    /// candidate list, preserving registration order.
    pub fn discover(&self) -> Result<Vec<Candidate>, PlateError> {
        let mut candidates: Vec<Candidate> = Vec::new();
        // name -> index of the layer that claimed it
        let mut claimed: HashMap<String, usize> = HashMap::new();

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            for factory in &layer.factories {
                let descriptor = factory.descriptor();
                if descriptor.name.is_empty() {
                    return Err(PlateError::ModuleLoad {
                        module: "<unnamed>".to_string(),
                        cause: format!(
                            "factory in layer '{}' declares an empty module name",
                            layer.label
                        ),
                    });
                }

                match claimed.get(&descriptor.name) {
                    Some(&owner) if owner == layer_idx => {
                        return Err(PlateError::DuplicateModule {
                            name: descriptor.name.clone(),
                            layer: layer.label.clone(),
                        });
                    }
                    Some(&owner) => {
                        // Shadowed by a higher-priority layer.
                        debug!(
                            module = %descriptor.name,
                            winner = %self.layers[owner].label,
                            shadowed = %layer.label,
                            "module overridden"
                        );
                        continue;
                    }
                    None => {}
                }

                claimed.insert(descriptor.name.clone(), layer_idx);
                debug!(
                    module = %descriptor,
                    layer = %layer.label,
                    "discovered module"
                );
                candidates.push(Candidate {
                    descriptor,
                    factory: factory.clone(),
                    layer: layer.label.clone(),
                });
            }
        }

        Ok(candidates)
    }
}
