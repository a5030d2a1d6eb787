//! Provider lookup table
//!
//! Built once at process start and handed to the engine; there is no
//! process-wide registry.

use crate::error::{CloudError, Result};
use crate::provider::{CloudManager, ProviderContext};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ProviderFactory =
    Arc<dyn Fn(ProviderContext) -> Result<Arc<dyn CloudManager>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CloudRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl CloudRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(ProviderContext) -> Result<Arc<dyn CloudManager>> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(provider = %name, "registered cloud provider");
        self.factories.insert(name, Arc::new(factory));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(ProviderContext) -> Result<Arc<dyn CloudManager>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Builds the `name` backend for one cluster.
    pub fn cloud_manager(&self, name: &str, ctx: ProviderContext) -> Result<Arc<dyn CloudManager>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CloudError::ProviderNotFound(name.to_string()))?;
        factory(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCloud, FakeKube};
    use fleetforge_core::Store;

    #[test]
    fn test_unknown_provider() {
        let registry = CloudRegistry::new();
        let ctx = ProviderContext::new(Store::in_memory(), Arc::new(FakeKube::new("v1.13.5")));
        let err = registry.cloud_manager("nope", ctx).err().unwrap();
        assert!(matches!(err, CloudError::ProviderNotFound(name) if name == "nope"));
    }

    #[test]
    fn test_register_and_resolve() {
        let kube = FakeKube::new("v1.13.5");
        let cloud = FakeCloud::new(kube.clone());
        let registry = CloudRegistry::new().with("fake", cloud.factory());

        assert!(registry.contains("fake"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["fake"]);

        let ctx = ProviderContext::new(Store::in_memory(), Arc::new(kube));
        let manager = registry.cloud_manager("fake", ctx).unwrap();
        assert_eq!(manager.name(), "fake");
    }
}
