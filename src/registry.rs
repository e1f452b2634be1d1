use std::collections::BTreeMap;

use burn::tensor::{backend::Backend, Device};

use crate::{FfnError, FrustumFeatureNet, FrustumFeatureNetConfig};

/// Builds a backbone from its configuration.
pub type BackboneConstructor<B> =
    fn(&FrustumFeatureNetConfig, &Device<B>) -> Result<FrustumFeatureNet<B>, FfnError>;

/// Explicit name-to-constructor table filled by the orchestration code.
pub struct BackboneRegistry<B: Backend> {
    constructors: BTreeMap<String, BackboneConstructor<B>>,
}

impl<B: Backend> Default for BackboneRegistry<B> {
    fn default() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }
}

impl<B: Backend> BackboneRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every backbone of this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        FrustumFeatureNet::register(&mut registry);
        registry
    }

    /// Register `constructor` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, constructor: BackboneConstructor<B>) {
        let name = name.into();
        if self.constructors.insert(name.clone(), constructor).is_some() {
            log::warn!("Replacing registered backbone '{name}'");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        name: &str,
        config: &FrustumFeatureNetConfig,
        device: &Device<B>,
    ) -> Result<FrustumFeatureNet<B>, FfnError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| FfnError::UnknownComponent {
                name: name.to_owned(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })?;

        constructor(config, device)
    }
}
