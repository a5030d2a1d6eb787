//! Kubernetes API seam
//!
//! The engine talks to a live cluster only through [`KubeClient`]; the
//! kube-rs backed implementation lives in [`crate::kube_rs`].

use crate::error::Result;
use async_trait::async_trait;
use fleetforge_core::Node;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const KUBE_SYSTEM: &str = "kube-system";

/// Everything needed to reach a cluster as its administrator
#[derive(Debug, Clone)]
pub struct KubeEndpoint {
    /// Kubeconfig cluster entry name
    pub cluster_name: String,
    pub user_name: String,
    /// `https://host:port`
    pub server: String,
    pub ca_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

/// A secret as the engine reads and writes it (string data only)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretData {
    pub name: String,
    pub secret_type: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
}

/// Builds admin clients for a cluster endpoint
#[async_trait]
pub trait KubeConnector: Send + Sync {
    async fn connect(&self, endpoint: &KubeEndpoint) -> Result<Arc<dyn KubeClient>>;
}

/// Operations the engine performs against a live cluster
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Succeeds once the API server answers.
    async fn probe(&self) -> Result<()>;

    /// API server `gitVersion`, e.g. `v1.13.5`
    async fn server_version(&self) -> Result<String>;

    async fn component_statuses(&self) -> Result<Vec<ComponentHealth>>;

    /// Nodes matching a label selector (`key=value` or `key`, comma separated).
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;

    async fn cordon_node(&self, name: &str) -> Result<()>;

    /// Evicts every pod on the node except daemonset-managed and mirror pods.
    async fn evict_pods(&self, node: &str) -> Result<()>;

    async fn delete_node(&self, name: &str) -> Result<()>;

    async fn list_secrets(&self, namespace: &str, secret_type: &str) -> Result<Vec<SecretData>>;

    async fn create_secret(&self, namespace: &str, secret: &SecretData) -> Result<()>;

    /// Server-side applies a multi-document YAML (or JSON) bundle.
    async fn apply_manifests(&self, manifests: &str) -> Result<()>;

    async fn namespace_uid(&self, name: &str) -> Result<String>;
}

/// `key=value` selector for a single label
pub fn label_selector(key: &str, value: &str) -> String {
    if value.is_empty() {
        key.to_string()
    } else {
        format!("{key}={value}")
    }
}
