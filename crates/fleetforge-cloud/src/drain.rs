//! Safe node removal
//!
//! Each node is cordoned, evicted, its instance deleted through the provider,
//! and finally its Node object removed. A failing node does not stop the
//! batch; failures are collected and reported together.

use crate::error::{CloudError, Result};
use crate::kube::KubeClient;
use crate::provider::InstanceManager;
use fleetforge_core::Node;

/// Outcome of draining a batch of nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Nodes whose instance is gone
    pub removed: Vec<String>,
    /// `(node, reason)` for nodes still running
    pub failed: Vec<(String, String)>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// `PartialDrain` if any node failed.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.failed.is_empty() {
            Ok(self.removed)
        } else {
            Err(CloudError::PartialDrain {
                removed: self.removed,
                failed: self.failed,
            })
        }
    }
}

pub struct NodeDrainer<'a> {
    client: &'a dyn KubeClient,
    instances: &'a dyn InstanceManager,
}

impl<'a> NodeDrainer<'a> {
    pub fn new(client: &'a dyn KubeClient, instances: &'a dyn InstanceManager) -> Self {
        Self { client, instances }
    }

    pub async fn drain_and_delete(&self, nodes: &[Node]) -> DrainReport {
        let mut report = DrainReport::default();
        for node in nodes {
            match self.remove(node).await {
                Ok(()) => report.removed.push(node.name.clone()),
                Err(e) => {
                    tracing::warn!(node = %node.name, "failed to remove node: {e}");
                    report.failed.push((node.name.clone(), e.to_string()));
                }
            }
        }
        report
    }

    async fn remove(&self, node: &Node) -> Result<()> {
        if node.provider_id.is_empty() {
            return Err(CloudError::Validation(format!(
                "node {} has no provider id",
                node.name
            )));
        }

        tracing::info!(node = %node.name, "draining node");
        self.client.cordon_node(&node.name).await?;
        self.client.evict_pods(&node.name).await?;

        self.instances
            .delete_instance_by_provider_id(&node.provider_id)
            .await?;

        // The instance is gone; a leftover Node object is only cosmetic.
        if let Err(e) = self.client.delete_node(&node.name).await {
            tracing::warn!(node = %node.name, "failed to delete node object: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCloud, FakeKube};

    fn node(kube: &FakeKube, name: &str) -> Node {
        kube.add_node(Node {
            name: name.to_string(),
            provider_id: format!("fake://{name}"),
            kubelet_version: "v1.13.5".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_drains_every_node() {
        let kube = FakeKube::new("v1.13.5");
        let cloud = FakeCloud::new(kube.clone());
        let nodes = vec![node(&kube, "a"), node(&kube, "b")];

        let report = NodeDrainer::new(&kube, &cloud)
            .drain_and_delete(&nodes)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.removed, vec!["a", "b"]);
        assert!(kube.nodes().is_empty());
        assert_eq!(kube.cordoned(), vec!["a", "b"]);
        assert_eq!(cloud.deleted_instances(), vec!["fake://a", "fake://b"]);
    }

    #[tokio::test]
    async fn test_continues_past_a_failing_node() {
        let kube = FakeKube::new("v1.13.5");
        let cloud = FakeCloud::new(kube.clone());
        let nodes = vec![node(&kube, "a"), node(&kube, "b"), node(&kube, "c")];
        kube.fail_drain("b");

        let report = NodeDrainer::new(&kube, &cloud)
            .drain_and_delete(&nodes)
            .await;

        assert_eq!(report.removed, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert_eq!(kube.nodes().len(), 1);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, CloudError::PartialDrain { ref removed, .. } if removed.len() == 2));
    }

    #[tokio::test]
    async fn test_node_without_provider_id_is_not_touched() {
        let kube = FakeKube::new("v1.13.5");
        let cloud = FakeCloud::new(kube.clone());
        let orphan = kube.add_node(Node {
            name: "orphan".to_string(),
            ..Default::default()
        });

        let report = NodeDrainer::new(&kube, &cloud)
            .drain_and_delete(&[orphan])
            .await;

        assert!(!report.is_complete());
        assert!(kube.cordoned().is_empty());
        assert!(cloud.deleted_instances().is_empty());
    }
}
