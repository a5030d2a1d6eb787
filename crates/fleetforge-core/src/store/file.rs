//! Filesystem backend
//!
//! One JSON document per record:
//!
//! ```text
//! <root>/
//! ├── cluster/_/demo.json
//! ├── nodegroup/demo/pool-a.json
//! ├── nodegroup/demo/pool-a.json.backup
//! └── locks/demo.lock.json
//! ```

use super::{ResourceKind, StoreBackend};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const TOP_LEVEL_SCOPE: &str = "_";
const LOCK_DIR: &str = "locks";
const BACKUP_SUFFIX: &str = "backup";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, kind: ResourceKind, scope: &str) -> PathBuf {
        let scope = if scope.is_empty() {
            TOP_LEVEL_SCOPE
        } else {
            scope
        };
        self.root.join(kind.as_str()).join(scope)
    }

    fn object_path(&self, kind: ResourceKind, scope: &str, name: &str) -> PathBuf {
        self.scope_dir(kind, scope).join(format!("{name}.json"))
    }

    fn lock_path(&self, cluster: &str) -> PathBuf {
        self.root.join(LOCK_DIR).join(format!("{cluster}.lock.json"))
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
            tracing::debug!("Created store directory: {}", dir.display());
        }
        Ok(())
    }

    /// Takes the per-cluster lock held while a command reconciles it.
    /// Locks older than an hour are treated as abandoned.
    pub async fn acquire_lock(&self, cluster: &str) -> Result<StateLock> {
        let lock_path = self.lock_path(cluster);
        if let Some(parent) = lock_path.parent() {
            Self::ensure_dir(parent).await?;
        }

        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            let lock_info: LockInfo = serde_json::from_str(&content)?;

            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < 1 {
                return Err(CoreError::Lock(format!(
                    "cluster `{}` is locked by {} since {}",
                    cluster, lock_info.holder, lock_info.acquired_at
                )));
            }

            tracing::warn!("Removing stale lock on {} from {}", cluster, lock_info.holder);
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };

        let content = serde_json::to_string_pretty(&lock_info)?;
        fs::write(&lock_path, content).await?;

        tracing::debug!("Acquired lock on {}", cluster);
        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

#[async_trait]
impl StoreBackend for FileStore {
    async fn read(
        &self,
        kind: ResourceKind,
        scope: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>> {
        let path = self.object_path(kind, scope, name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn list(&self, kind: ResourceKind, scope: &str) -> Result<Vec<serde_json::Value>> {
        let dir = self.scope_dir(kind, scope);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut values = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            values.push(serde_json::from_str(&content)?);
        }
        Ok(values)
    }

    async fn write(
        &self,
        kind: ResourceKind,
        scope: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let dir = self.scope_dir(kind, scope);
        Self::ensure_dir(&dir).await?;

        let path = self.object_path(kind, scope, name);
        let backup = path.with_extension(format!("json.{BACKUP_SUFFIX}"));

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }

        let content = serde_json::to_string_pretty(&value)?;
        fs::write(&path, content).await?;
        Ok(())
    }

    async fn remove(&self, kind: ResourceKind, scope: &str, name: &str) -> Result<bool> {
        let path = self.object_path(kind, scope, name);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).await?;

        let backup = path.with_extension(format!("json.{BACKUP_SUFFIX}"));
        if backup.exists() {
            fs::remove_file(&backup).await?;
        }
        Ok(true)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for a cluster lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released lock {}", self.lock_path.display());
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
