//! Node group reconciliation
//!
//! Compares a group's desired replica count with the nodes that carry its
//! label and adds or drains the difference. There is no explicit state: the
//! branch is picked from `spec.nodes` against the live count.

use crate::action::{Action, ActionType};
use crate::drain::NodeDrainer;
use crate::error::{CloudError, Result, ResultExt};
use crate::kube::{KubeClient, label_selector};
use crate::provider::InstanceManager;
use crate::token::{self, TokenConfig};
use fleetforge_core::{Cluster, NODE_GROUP_LABEL, Node, NodeGroup, Store};
use std::sync::Arc;

const INSTANCE_SUFFIX_LEN: usize = 6;

pub struct NodeGroupManager {
    store: Store,
    cluster: Cluster,
    node_group: NodeGroup,
    instances: Arc<dyn InstanceManager>,
    /// `None` until the cluster has an API endpoint; the group is then treated as empty.
    client: Option<Arc<dyn KubeClient>>,
    token: TokenConfig,
}

impl NodeGroupManager {
    pub fn new(
        store: Store,
        cluster: Cluster,
        node_group: NodeGroup,
        instances: Arc<dyn InstanceManager>,
        client: Option<Arc<dyn KubeClient>>,
    ) -> Self {
        Self {
            store,
            cluster,
            node_group,
            instances,
            client,
            token: TokenConfig::default(),
        }
    }

    pub fn with_token_config(mut self, token: TokenConfig) -> Self {
        self.token = token;
        self
    }

    /// The group record as last persisted by this manager.
    pub fn node_group(&self) -> &NodeGroup {
        &self.node_group
    }

    pub async fn apply(&mut self, dry_run: bool) -> Result<Vec<Action>> {
        let name = self.node_group.name().to_string();
        let nodes = self.live_nodes().await?;

        self.node_group.status.nodes = nodes.len() as u32;
        self.node_group.status.observed_generation = self.node_group.metadata.generation;
        self.persist_status().await?;

        let desired = self.node_group.spec.nodes;
        let observed = self.node_group.status.nodes;
        let mut acts = Vec::new();

        if self.node_group.metadata.is_deleting() {
            acts.push(Action::new(
                ActionType::Delete,
                "Node group",
                format!("Node group {name} will be deleted"),
            ));
            if !dry_run {
                self.delete_group(&nodes).await?;
            }
        } else if desired == observed {
            acts.push(Action::new(
                ActionType::Nop,
                "Node group",
                format!("No change required for node group {name}"),
            ));
        } else if desired < observed {
            let count = observed - desired;
            acts.push(Action::new(
                ActionType::Delete,
                "Node",
                format!("{count} node will be deleted from {name} group"),
            ));
            if !dry_run {
                self.delete_nodes(&nodes[desired as usize..]).await?;
            }
        } else {
            let count = desired - observed;
            acts.push(Action::new(
                ActionType::Add,
                "Node",
                format!("{count} node will be added to {name} group"),
            ));
            if !dry_run {
                self.add_nodes(count).await?;
            }
        }

        Ok(acts)
    }

    async fn live_nodes(&self) -> Result<Vec<Node>> {
        let Some(client) = &self.client else {
            return Ok(Vec::new());
        };
        client
            .list_nodes(&label_selector(NODE_GROUP_LABEL, self.node_group.name()))
            .await
            .with_context(|| format!("failed to list nodes of group {}", self.node_group.name()))
    }

    fn client(&self) -> Result<&dyn KubeClient> {
        self.client.as_deref().ok_or_else(|| {
            CloudError::Validation(format!(
                "cluster `{}` has no reachable API server",
                self.cluster.name()
            ))
        })
    }

    async fn persist_status(&mut self) -> Result<()> {
        self.node_group = self
            .store
            .update_status(&self.node_group)
            .await
            .with_context(|| format!("failed to update status of node group {}", self.node_group.name()))?;
        Ok(())
    }

    /// Drains `nodes` and records how many are actually gone.
    async fn delete_nodes(&mut self, nodes: &[Node]) -> Result<()> {
        let report = NodeDrainer::new(self.client()?, self.instances.as_ref())
            .drain_and_delete(nodes)
            .await;

        self.node_group.status.nodes -= report.removed.len() as u32;
        self.persist_status().await?;
        report.into_result()?;

        if self.node_group.status.nodes == 0 {
            self.instances
                .cleanup_node_group(&self.node_group)
                .await
                .with_context(|| format!("failed to clean up node group {}", self.node_group.name()))?;
        }
        Ok(())
    }

    async fn delete_group(&mut self, nodes: &[Node]) -> Result<()> {
        if !nodes.is_empty() {
            self.delete_nodes(nodes).await?;
        } else {
            self.instances
                .cleanup_node_group(&self.node_group)
                .await
                .with_context(|| format!("failed to clean up node group {}", self.node_group.name()))?;
        }

        self.store
            .delete::<NodeGroup>(self.cluster.name(), self.node_group.name())
            .await
            .with_context(|| format!("failed to delete node group {}", self.node_group.name()))?;
        tracing::info!(node_group = %self.node_group.name(), "node group deleted");
        Ok(())
    }

    async fn add_nodes(&mut self, count: u32) -> Result<()> {
        let client = self.client()?;
        let ng_name = self.node_group.name().to_string();

        self.instances
            .prepare_node_group(&self.node_group)
            .await
            .with_context(|| format!("failed to prepare node group {ng_name}"))?;

        let join_token = token::get_existing_kubeadm_token(client, &self.token).await?;

        let mut failure = None;
        for _ in 0..count {
            let name = format!("{ng_name}-{}", token::random_string(INSTANCE_SUFFIX_LEN));
            match self
                .instances
                .create_instance(&self.cluster, &name, &join_token, &self.node_group)
                .await
            {
                Ok(info) => {
                    tracing::info!(node = %info.name, provider_id = %info.provider_id, "instance created");
                    self.node_group.status.nodes += 1;
                }
                Err(e) => {
                    failure = Some(CloudError::Context {
                        context: format!("failed to create instance {name}"),
                        source: Box::new(e),
                    });
                    break;
                }
            }
        }

        self.persist_status().await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
