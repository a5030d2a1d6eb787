//! Control-plane machines and worker node groups

use super::meta::{NODE_GROUP_LABEL, ObjectMeta, ROLE_MASTER_LABEL, ROLE_NODE_LABEL};
use super::node::NodeAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineRole {
    Master,
    Node,
}

impl fmt::Display for MachineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineRole::Master => write!(f, "master"),
            MachineRole::Node => write!(f, "node"),
        }
    }
}

/// One control-plane instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: ObjectMeta,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub roles: Vec<MachineRole>,

    /// Provider-specific, opaque to the engine
    #[serde(default)]
    pub provider_spec: serde_json::Value,

    pub versions: MachineVersions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersions {
    pub kubelet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
}

impl Machine {
    /// Master machine `{cluster}-master-{index}`
    pub fn master(cluster: &str, index: u32, version: &str) -> Self {
        Self {
            metadata: ObjectMeta::owned_by(format!("{cluster}-master-{index}"), cluster)
                .with_label(ROLE_MASTER_LABEL, ""),
            spec: MachineSpec {
                roles: vec![MachineRole::Master],
                provider_spec: serde_json::Value::Null,
                versions: MachineVersions {
                    kubelet: version.to_string(),
                    control_plane: version.to_string(),
                },
            },
            status: MachineStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_master(&self) -> bool {
        self.spec.roles.contains(&MachineRole::Master)
            || self.metadata.labels.contains_key(ROLE_MASTER_LABEL)
    }
}

/// A named pool of worker machines (a cluster-api MachineSet)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub metadata: ObjectMeta,
    pub spec: NodeGroupSpec,
    #[serde(default)]
    pub status: NodeGroupStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Desired replica count
    pub nodes: u32,
    pub template: NodeTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    /// Instance size name in the provider's vocabulary
    pub sku: String,

    #[serde(default)]
    pub provider_spec: serde_json::Value,

    #[serde(default)]
    pub kubelet_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    pub nodes: u32,
    pub observed_generation: i64,
}

impl NodeGroup {
    pub fn new(cluster: &str, name: impl Into<String>, sku: impl Into<String>, nodes: u32) -> Self {
        let name = name.into();
        Self {
            metadata: ObjectMeta::owned_by(name.clone(), cluster)
                .with_label(ROLE_NODE_LABEL, "")
                .with_label(NODE_GROUP_LABEL, name),
            spec: NodeGroupSpec {
                nodes,
                template: NodeTemplate {
                    sku: sku.into(),
                    ..Default::default()
                },
            },
            status: NodeGroupStatus::default(),
        }
    }

    /// Default group name for a SKU: `n1_standard_2` becomes `n1-standard-2-pool`.
    pub fn name_for_sku(sku: &str) -> String {
        format!("{}-pool", sku.replace('_', "-"))
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_master(&self) -> bool {
        self.metadata.labels.contains_key(ROLE_MASTER_LABEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_machine_naming() {
        let machine = Machine::master("demo", 2, "v1.13.5");
        assert_eq!(machine.name(), "demo-master-2");
        assert_eq!(machine.metadata.cluster_name, "demo");
        assert_eq!(machine.metadata.labels.get(ROLE_MASTER_LABEL).unwrap(), "");
        assert!(machine.is_master());
    }

    #[test]
    fn test_node_group_name_for_sku() {
        assert_eq!(NodeGroup::name_for_sku("2core_4gb"), "2core-4gb-pool");
        let ng = NodeGroup::new("demo", "pool-a", "2core-4gb", 3);
        assert_eq!(ng.metadata.labels.get(NODE_GROUP_LABEL).unwrap(), "pool-a");
        assert!(!ng.is_master());
    }
}
