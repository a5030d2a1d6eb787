use super::{ResourceKind, StoreBackend};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

type Key = (ResourceKind, String, String);

/// Process-local backend, used by tests and `--store memory`
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<Key, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn read(
        &self,
        kind: ResourceKind,
        scope: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>> {
        let objects = self.objects.read().await;
        Ok(objects
            .get(&(kind, scope.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, kind: ResourceKind, scope: &str) -> Result<Vec<serde_json::Value>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|((k, s, _), _)| *k == kind && s == scope)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn write(
        &self,
        kind: ResourceKind,
        scope: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut objects = self.objects.write().await;
        objects.insert((kind, scope.to_string(), name.to_string()), value);
        Ok(())
    }

    async fn remove(&self, kind: ResourceKind, scope: &str, name: &str) -> Result<bool> {
        let mut objects = self.objects.write().await;
        Ok(objects
            .remove(&(kind, scope.to_string(), name.to_string()))
            .is_some())
    }
}
