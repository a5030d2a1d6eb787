//! Persistence for cluster records
//!
//! Backends only move JSON documents around ([`StoreBackend`]); the typed
//! [`Store`] on top owns the semantics: `create` refuses duplicates,
//! `update`/`update_status` refuse stale writes by comparing
//! `resource_version`, and only `update` bumps `generation`.

mod file;
mod memory;

pub use file::{FileStore, StateLock};
pub use memory::MemoryStore;

use crate::error::{CoreError, Result};
use crate::model::{
    CertificateRecord, Cluster, Credential, Machine, NodeGroup, ObjectMeta, SshKeyRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Kinds of stored records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cluster,
    NodeGroup,
    Machine,
    Certificate,
    SshKey,
    Credential,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::NodeGroup => "nodegroup",
            ResourceKind::Machine => "machine",
            ResourceKind::Certificate => "certificate",
            ResourceKind::SshKey => "sshkey",
            ResourceKind::Credential => "credential",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record the [`Store`] can persist
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Copies the status half of `from` into `self`, leaving spec untouched.
    fn copy_status_from(&mut self, _from: &Self) {}

    /// Partition key: the owning cluster, or empty for top-level records.
    fn scope(&self) -> &str {
        &self.meta().cluster_name
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl_resource!($ty, $kind, |_to, _from| {});
    };
    ($ty:ty, $kind:expr, |$to:ident, $from:ident| $copy:block) => {
        impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn copy_status_from(&mut self, from: &Self) {
                let $to = self;
                let $from = from;
                $copy
            }
        }
    };
}

impl_resource!(Cluster, ResourceKind::Cluster, |to, from| {
    to.status = from.status.clone();
});
impl_resource!(NodeGroup, ResourceKind::NodeGroup, |to, from| {
    to.status = from.status.clone();
});
impl_resource!(Machine, ResourceKind::Machine, |to, from| {
    to.status = from.status.clone();
});
impl_resource!(CertificateRecord, ResourceKind::Certificate);
impl_resource!(SshKeyRecord, ResourceKind::SshKey);
impl_resource!(Credential, ResourceKind::Credential);

/// Raw document storage
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn read(
        &self,
        kind: ResourceKind,
        scope: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>>;

    async fn list(&self, kind: ResourceKind, scope: &str) -> Result<Vec<serde_json::Value>>;

    async fn write(
        &self,
        kind: ResourceKind,
        scope: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()>;

    /// Returns whether a document was removed.
    async fn remove(&self, kind: ResourceKind, scope: &str, name: &str) -> Result<bool>;
}

/// Typed store over a [`StoreBackend`]
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
    // serialises read-check-write sequences within this process
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn find<T: Resource>(&self, scope: &str, name: &str) -> Result<Option<T>> {
        match self.backend.read(T::KIND, scope, name).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn get<T: Resource>(&self, scope: &str, name: &str) -> Result<T> {
        self.find(scope, name)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                kind: T::KIND.as_str(),
                name: name.to_string(),
            })
    }

    /// All records of a kind in `scope`, ordered by name.
    pub async fn list<T: Resource>(&self, scope: &str) -> Result<Vec<T>> {
        let mut items = self
            .backend
            .list(T::KIND, scope)
            .await?
            .into_iter()
            .map(serde_json::from_value::<T>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        Ok(items)
    }

    pub async fn create<T: Resource>(&self, obj: &T) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let meta = obj.meta();
        if meta.name.is_empty() {
            return Err(CoreError::Validation(format!(
                "{} name is required",
                T::KIND
            )));
        }
        if self
            .backend
            .read(T::KIND, obj.scope(), &meta.name)
            .await?
            .is_some()
        {
            return Err(CoreError::AlreadyExists {
                kind: T::KIND.as_str(),
                name: meta.name.clone(),
            });
        }

        let mut created = obj.clone();
        let m = created.meta_mut();
        m.uid = uuid::Uuid::new_v4().to_string();
        m.generation = 1;
        m.resource_version = 1;
        m.creation_timestamp = Some(Utc::now());

        self.put(&created).await?;
        Ok(created)
    }

    /// Persists spec and status, bumping `generation`.
    pub async fn update<T: Resource>(&self, obj: &T) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let current: T = self.current_for_write(obj).await?;

        let mut updated = obj.clone();
        let m = updated.meta_mut();
        m.uid = current.meta().uid.clone();
        m.creation_timestamp = current.meta().creation_timestamp;
        m.generation = current.meta().generation + 1;
        m.resource_version = current.meta().resource_version + 1;

        self.put(&updated).await?;
        Ok(updated)
    }

    /// Persists only the status half of `obj` on top of the stored record.
    pub async fn update_status<T: Resource>(&self, obj: &T) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let mut stored: T = self.current_for_write(obj).await?;
        stored.copy_status_from(obj);
        stored.meta_mut().resource_version += 1;

        self.put(&stored).await?;
        Ok(stored)
    }

    pub async fn delete<T: Resource>(&self, scope: &str, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.backend.remove(T::KIND, scope, name).await? {
            return Err(CoreError::NotFound {
                kind: T::KIND.as_str(),
                name: name.to_string(),
            });
        }
        tracing::debug!(kind = %T::KIND, scope, name, "deleted");
        Ok(())
    }

    async fn current_for_write<T: Resource>(&self, obj: &T) -> Result<T> {
        let meta = obj.meta();
        let current: T = self.get(obj.scope(), &meta.name).await?;
        if current.meta().resource_version != meta.resource_version {
            return Err(CoreError::ObjectModified {
                kind: T::KIND.as_str(),
                name: meta.name.clone(),
            });
        }
        Ok(current)
    }

    async fn put<T: Resource>(&self, obj: &T) -> Result<()> {
        let meta = obj.meta();
        let value = serde_json::to_value(obj)?;
        self.backend
            .write(T::KIND, obj.scope(), &meta.name, value)
            .await?;
        tracing::debug!(
            kind = %T::KIND,
            scope = obj.scope(),
            name = %meta.name,
            version = meta.resource_version,
            "stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterConfig, ClusterPhase};

    fn demo() -> Cluster {
        Cluster::new(
            "demo",
            ClusterConfig {
                master_count: 1,
                kubernetes_version: "v1.13.5".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = Store::in_memory();
        let created = store.create(&demo()).await.unwrap();
        assert_eq!(created.metadata.generation, 1);
        assert_eq!(created.metadata.resource_version, 1);
        assert!(!created.metadata.uid.is_empty());

        let err = store.create(&demo()).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists { .. }));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_stale_update_is_object_modified() {
        let store = Store::in_memory();
        let created = store.create(&demo()).await.unwrap();

        let mut first = created.clone();
        first.config.master_count = 3;
        let first = store.update(&first).await.unwrap();
        assert_eq!(first.metadata.generation, 2);

        let mut stale = created;
        stale.config.master_count = 5;
        let err = store.update(&stale).await.unwrap_err();
        assert!(matches!(err, CoreError::ObjectModified { .. }));

        let stored: Cluster = store.get("", "demo").await.unwrap();
        assert_eq!(stored.config.master_count, 3);
    }

    #[tokio::test]
    async fn test_update_status_keeps_spec_and_generation() {
        let store = Store::in_memory();
        let created = store.create(&demo()).await.unwrap();

        let mut edited = created.clone();
        edited.config.master_count = 7;
        edited.status.phase = ClusterPhase::Pending;
        let updated = store.update_status(&edited).await.unwrap();

        assert_eq!(updated.config.master_count, 1);
        assert_eq!(updated.status.phase, ClusterPhase::Pending);
        assert_eq!(updated.metadata.generation, 1);
        assert_eq!(updated.metadata.resource_version, 2);
    }

    #[tokio::test]
    async fn test_scoped_list_and_delete() {
        let store = Store::in_memory();
        store
            .create(&NodeGroup::new("demo", "pool-b", "2core-4gb", 1))
            .await
            .unwrap();
        store
            .create(&NodeGroup::new("demo", "pool-a", "2core-4gb", 1))
            .await
            .unwrap();
        store
            .create(&NodeGroup::new("other", "pool-a", "2core-4gb", 1))
            .await
            .unwrap();

        let groups: Vec<NodeGroup> = store.list("demo").await.unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["pool-a", "pool-b"]);

        store.delete::<NodeGroup>("demo", "pool-a").await.unwrap();
        let err = store.delete::<NodeGroup>("demo", "pool-a").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.find::<NodeGroup>("other", "pool-a").await.unwrap().is_some());
    }
}
