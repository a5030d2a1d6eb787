//! Object metadata shared by every stored record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carried by control-plane nodes and machines
pub const ROLE_MASTER_LABEL: &str = "node-role.kubernetes.io/master";

/// Label carried by worker nodes and node groups
pub const ROLE_NODE_LABEL: &str = "node-role.kubernetes.io/node";

/// Label identifying the node group a worker node belongs to
pub const NODE_GROUP_LABEL: &str = "fleetforge.dev/nodegroup";

/// Metadata common to clusters, machines, node groups and secrets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name, unique within its kind and cluster
    pub name: String,

    /// Owning cluster (empty for clusters and credentials)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,

    #[serde(default)]
    pub uid: String,

    /// Bumped on every spec change
    #[serde(default)]
    pub generation: i64,

    /// Optimistic concurrency token, bumped on every write
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Logical deletion marker; the next apply executes the removal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn owned_by(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster_name: cluster.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn mark_deleted(&mut self) {
        if self.deletion_timestamp.is_none() {
            self.deletion_timestamp = Some(Utc::now());
        }
    }
}
