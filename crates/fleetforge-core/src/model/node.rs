//! Snapshot of a live Kubernetes node

use super::meta::{NODE_GROUP_LABEL, ROLE_MASTER_LABEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    #[serde(rename = "InternalIP")]
    InternalIp,
    Hostname,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: AddressType,
    pub address: String,
}

impl NodeAddress {
    pub fn new(kind: AddressType, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }
}

/// The fields of a Kubernetes Node the engine reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,

    /// Stable cloud identifier (`spec.providerID`)
    #[serde(default)]
    pub provider_id: String,

    #[serde(default)]
    pub kubelet_version: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
}

impl Node {
    pub fn is_master(&self) -> bool {
        self.labels.contains_key(ROLE_MASTER_LABEL)
    }

    pub fn node_group(&self) -> Option<&str> {
        self.labels.get(NODE_GROUP_LABEL).map(String::as_str)
    }

    pub fn address(&self, kind: AddressType) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.address.as_str())
    }

    /// Address used to reach the node over SSH: external first, then internal.
    pub fn reachable_address(&self) -> Option<&str> {
        self.address(AddressType::ExternalIp)
            .or_else(|| self.address(AddressType::InternalIp))
    }
}
