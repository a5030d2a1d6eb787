//! Cluster record and lifecycle phases

use super::meta::ObjectMeta;
use super::node::{AddressType, NodeAddress};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default API server port for kubeadm-built control planes
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// A Kubernetes cluster managed by FleetForge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    pub config: ClusterConfig,
    #[serde(default)]
    pub status: ClusterStatus,
}

/// Desired cluster configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub master_count: u32,

    pub cloud: CloudSpec,

    pub kubernetes_version: String,

    /// Name of the stored credential used against the cloud backend
    #[serde(default)]
    pub credential_name: String,

    /// CNI plugin installed by the startup scripts
    #[serde(default)]
    pub network_provider: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_server_extra_args: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub controller_manager_extra_args: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scheduler_extra_args: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_server_cert_sans: Vec<String>,
}

/// Where the cluster runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSpec {
    /// Registry key of the backend (e.g. "sakura")
    pub cloud_provider: String,

    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub instance_image: String,

    #[serde(default)]
    pub os: String,

    /// Name under which the cluster SSH key is imported into the cloud
    #[serde(default)]
    pub ssh_key_name: String,
}

/// Observed cluster state, doubling as the resume point after a crash
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default)]
    pub cloud: CloudStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_endpoints: Vec<ApiEndpoint>,

    /// UID of the live cluster's kube-system namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_uid: String,
}

/// Provider-specific status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_external_id: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

/// Coarse lifecycle state of a cluster
///
/// ```text
/// Pending ──► Ready ◄──► Upgrading
///    │          │            │
///    └──────────┴─────┬──────┘
///                     ▼
///                 Deleting ──► Deleted
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    /// Empty phase: an unknown or corrupt record
    #[default]
    #[serde(rename = "")]
    Unknown,
    Pending,
    Ready,
    Upgrading,
    Deleting,
    Deleted,
}

impl ClusterPhase {
    pub fn can_transition_to(self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Upgrading)
                | (Upgrading, Ready)
                | (Pending | Ready | Upgrading, Deleting)
                | (Deleting, Deleted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterPhase::Unknown => "",
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Ready => "Ready",
            ClusterPhase::Upgrading => "Upgrading",
            ClusterPhase::Deleting => "Deleting",
            ClusterPhase::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Cluster {
    pub fn new(name: impl Into<String>, config: ClusterConfig) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            config,
            status: ClusterStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> ClusterPhase {
        self.status.phase
    }

    /// Moves the cluster to `next`, rejecting transitions outside the lifecycle graph.
    /// Re-entering the current phase is accepted so retried steps stay idempotent.
    pub fn transition_to(&mut self, next: ClusterPhase) -> Result<()> {
        let current = self.status.phase;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        tracing::info!(cluster = %self.metadata.name, from = %current, to = %next, "phase transition");
        self.status.phase = next;
        Ok(())
    }

    /// `https://host:port` of the first API endpoint, if the master is up
    pub fn api_server_url(&self) -> Option<String> {
        self.status
            .api_endpoints
            .first()
            .map(|ep| format!("https://{}:{}", ep.host, ep.port))
    }

    /// Records the master's addresses as API endpoints, public address first.
    pub fn set_api_endpoints(&mut self, addresses: &[NodeAddress]) {
        let mut endpoints = Vec::new();
        for kind in [AddressType::ExternalIp, AddressType::InternalIp] {
            for addr in addresses.iter().filter(|a| a.kind == kind) {
                endpoints.push(ApiEndpoint {
                    host: addr.address.clone(),
                    port: DEFAULT_API_SERVER_PORT,
                });
            }
        }
        self.status.api_endpoints = endpoints;
    }

    /// Name of the cluster entry in generated kubeconfigs
    pub fn kubeconfig_cluster_name(&self) -> String {
        format!("{}.fleetforge", self.metadata.name)
    }

    pub fn kubeconfig_user_name(&self) -> String {
        format!("cluster-admin@{}.fleetforge", self.metadata.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_empty_for_unknown() {
        let json = serde_json::to_string(&ClusterPhase::Unknown).unwrap();
        assert_eq!(json, "\"\"");
        let phase: ClusterPhase = serde_json::from_str("\"Ready\"").unwrap();
        assert_eq!(phase, ClusterPhase::Ready);
    }

    #[test]
    fn test_lifecycle_transitions() {
        use ClusterPhase::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Upgrading));
        assert!(Upgrading.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));

        assert!(!Unknown.can_transition_to(Ready));
        assert!(!Deleted.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Upgrading));
        assert!(!Ready.can_transition_to(Deleted));
    }

    #[test]
    fn test_transition_to_rejects_invalid() {
        let mut cluster = Cluster::new("demo", ClusterConfig::default());
        cluster.status.phase = ClusterPhase::Deleted;
        let err = cluster.transition_to(ClusterPhase::Ready).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(cluster.phase(), ClusterPhase::Deleted);
    }

    #[test]
    fn test_api_endpoints_prefer_external() {
        let mut cluster = Cluster::new("demo", ClusterConfig::default());
        assert!(cluster.api_server_url().is_none());

        cluster.set_api_endpoints(&[
            NodeAddress::new(AddressType::InternalIp, "10.0.0.2"),
            NodeAddress::new(AddressType::ExternalIp, "203.0.113.7"),
        ]);

        assert_eq!(
            cluster.api_server_url().as_deref(),
            Some("https://203.0.113.7:6443")
        );
        assert_eq!(cluster.status.api_endpoints.len(), 2);
    }
}
