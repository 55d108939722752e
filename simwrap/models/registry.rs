use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    beam::AnalyticBeam,
    model::{Model, ModelError},
};

/// Models by name, in registration order.
#[derive(Default, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, Arc<dyn Model>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.models.keys()).finish()
    }
}

impl ModelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the models that need no configuration.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AnalyticBeam::new()));
        registry
    }

    /// Adds `model` under its name, returning the model it replaced.
    pub fn register(&mut self, model: Arc<dyn Model>) -> Option<Arc<dyn Model>> {
        self.models.insert(model.name().to_owned(), model)
    }

    /// Looks a model up by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Model>, ModelError> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::UnknownModel {
                name: name.to_owned(),
                known: self.names().map(str::to_owned).collect(),
            })
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Registered models in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Model>> {
        self.models.values()
    }

    /// Number of registered models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no model is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_beam() {
        let registry = ModelRegistry::builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["beam"]);
        assert_eq!(registry.get("beam").unwrap().input_description().len(), 4);
    }

    #[test]
    fn unknown_names_list_the_known_ones() {
        let registry = ModelRegistry::builtin();
        let Err(err) = registry.get("bridge") else {
            panic!("`bridge` is not a registered model");
        };
        assert_eq!(err.to_string(), "unknown model `bridge` (known: beam)");
    }

    #[test]
    fn registering_twice_replaces() {
        let mut registry = ModelRegistry::new();
        assert!(registry.register(Arc::new(AnalyticBeam::new())).is_none());
        assert!(registry.register(Arc::new(AnalyticBeam::new())).is_some());
        assert_eq!(registry.len(), 1);
    }
}
