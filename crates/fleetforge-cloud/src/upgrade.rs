//! Rolling version upgrade: the master first, then every worker node
//!
//! A patch bump (same major.minor) only upgrades the kubelet packages; any
//! other bump goes through `kubeadm upgrade`.

use crate::action::{Action, ActionType};
use crate::error::{CloudError, Result, ResultExt};
use crate::kube::{KubeClient, label_selector};
use crate::provider::CloudManager;
use crate::remote::RemoteExecutor;
use crate::wait::{self, PollConfig};
use fleetforge_core::{
    Cluster, KubeVersion, Machine, NODE_GROUP_LABEL, Node, NodeGroup, ROLE_MASTER_LABEL, Store,
};
use std::sync::Arc;

/// Shell steps upgrading the master to `version`.
pub fn master_upgrade_steps(version: &str, patch: bool) -> Vec<String> {
    let mut steps = vec!["apt-get update".to_string()];
    if patch {
        steps.push("apt-get upgrade -y kubelet kubectl".to_string());
    }
    steps.push(format!("kubeadm upgrade apply {version} -y"));
    steps
}

/// Shell steps upgrading one worker node.
pub fn node_upgrade_steps(patch: bool) -> Vec<String> {
    let mut steps = vec!["apt-get update".to_string()];
    if patch {
        steps.push("apt-get upgrade -y kubelet kubectl".to_string());
    } else {
        steps.push("kubeadm upgrade node".to_string());
    }
    steps.push("systemctl restart kubelet".to_string());
    steps
}

fn script(steps: &[String]) -> String {
    format!("sh -c 'set -e; {}'", steps.join("; "))
}

/// Unparseable kubelet versions take the kubeadm path.
fn patch_only(desired: &KubeVersion, current: &str) -> bool {
    KubeVersion::parse(current)
        .map(|current| desired.is_patch_of(&current))
        .unwrap_or(false)
}

pub struct UpgradeManager {
    store: Store,
    cluster: Cluster,
    cloud: Arc<dyn CloudManager>,
    client: Arc<dyn KubeClient>,
    executor: Arc<dyn RemoteExecutor>,
    poll: PollConfig,
}

impl UpgradeManager {
    pub fn new(
        store: Store,
        cluster: Cluster,
        cloud: Arc<dyn CloudManager>,
        client: Arc<dyn KubeClient>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            store,
            cluster,
            cloud,
            client,
            executor,
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub async fn apply(&self, dry_run: bool) -> Result<Vec<Action>> {
        let version = self.cluster.config.kubernetes_version.clone();
        let desired = KubeVersion::parse(&version)?;
        let mut acts = Vec::new();

        acts.push(Action::new(
            ActionType::Update,
            "Master upgrade",
            format!("Master instance will be upgraded to {version}"),
        ));
        if !dry_run {
            self.upgrade_master(&version, &desired).await?;
            wait::wait_for_master_version(self.client.as_ref(), &desired, &self.poll).await?;
            self.record_master_versions(&version).await?;
        }

        acts.push(Action::new(
            ActionType::Update,
            "Node group upgrade",
            format!("Node group will be upgraded to {version}"),
        ));
        if !dry_run {
            for ng in self.store.list::<NodeGroup>(self.cluster.name()).await? {
                if ng.is_master() {
                    continue;
                }
                self.upgrade_node_group(ng, &version, &desired).await?;
            }
        }

        Ok(acts)
    }

    async fn upgrade_master(&self, version: &str, desired: &KubeVersion) -> Result<()> {
        let masters = self
            .client
            .list_nodes(&label_selector(ROLE_MASTER_LABEL, ""))
            .await
            .context("failed to list master nodes")?;
        let master = match masters.as_slice() {
            [master] => master,
            [] => return Err(CloudError::Topology("no master found".to_string())),
            _ => return Err(CloudError::Topology("multiple master found".to_string())),
        };

        let patch = patch_only(desired, &master.kubelet_version);
        let command = script(&master_upgrade_steps(version, patch));
        tracing::info!(node = %master.name, patch, "upgrading master");
        self.run(master, &command).await
    }

    async fn record_master_versions(&self, version: &str) -> Result<()> {
        for mut machine in self.store.list::<Machine>(self.cluster.name()).await? {
            if !machine.is_master() {
                continue;
            }
            machine.spec.versions.kubelet = version.to_string();
            machine.spec.versions.control_plane = version.to_string();
            self.store
                .update(&machine)
                .await
                .with_context(|| format!("failed to update machine {}", machine.name()))?;
        }
        Ok(())
    }

    async fn upgrade_node_group(
        &self,
        mut ng: NodeGroup,
        version: &str,
        desired: &KubeVersion,
    ) -> Result<()> {
        let nodes = self
            .client
            .list_nodes(&label_selector(NODE_GROUP_LABEL, ng.name()))
            .await
            .with_context(|| format!("failed to list nodes of group {}", ng.name()))?;

        for node in &nodes {
            let current = KubeVersion::parse(&node.kubelet_version).ok();
            if current.as_ref() == Some(desired) {
                continue;
            }
            let patch = patch_only(desired, &node.kubelet_version);
            tracing::info!(node = %node.name, patch, "upgrading node");
            self.run(node, &script(&node_upgrade_steps(patch))).await?;
        }

        ng.spec.template.kubelet_version = version.to_string();
        self.store
            .update(&ng)
            .await
            .with_context(|| format!("failed to update node group {}", ng.name()))?;
        Ok(())
    }

    async fn run(&self, node: &Node, command: &str) -> Result<()> {
        let ssh = self.cloud.ssh_config(&self.cluster, node)?;
        self.executor
            .execute(&ssh, command)
            .await
            .with_context(|| format!("failed to upgrade {}", node.name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCloud, FakeKube, RecordingExecutor};
    use fleetforge_core::{ClusterConfig, ClusterPhase, ROLE_NODE_LABEL};
    use std::time::Duration;

    #[test]
    fn test_master_steps() {
        assert_eq!(
            master_upgrade_steps("v1.13.6", true),
            vec![
                "apt-get update",
                "apt-get upgrade -y kubelet kubectl",
                "kubeadm upgrade apply v1.13.6 -y"
            ]
        );
        assert_eq!(
            master_upgrade_steps("v1.14.0", false),
            vec!["apt-get update", "kubeadm upgrade apply v1.14.0 -y"]
        );
    }

    #[test]
    fn test_node_steps() {
        assert!(node_upgrade_steps(true).contains(&"apt-get upgrade -y kubelet kubectl".to_string()));
        assert!(node_upgrade_steps(false).contains(&"kubeadm upgrade node".to_string()));
        assert_eq!(
            node_upgrade_steps(false).last().map(String::as_str),
            Some("systemctl restart kubelet")
        );
    }

    struct Fixture {
        store: Store,
        kube: FakeKube,
        cloud: FakeCloud,
        executor: RecordingExecutor,
        cluster: Cluster,
    }

    async fn fixture(target: &str) -> Fixture {
        let store = Store::in_memory();
        let kube = FakeKube::new("v1.13.5");
        let cloud = FakeCloud::new(kube.clone());
        let executor = RecordingExecutor::new(kube.clone());
        let mut cluster = Cluster::new(
            "demo",
            ClusterConfig {
                kubernetes_version: target.to_string(),
                ..Default::default()
            },
        );
        cluster.status.phase = ClusterPhase::Upgrading;
        let cluster = store.create(&cluster).await.unwrap();
        store
            .create(&NodeGroup::new("demo", "pool-a", "2core-4gb", 2))
            .await
            .unwrap();
        Fixture {
            store,
            kube,
            cloud,
            executor,
            cluster,
        }
    }

    fn kube_node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            name: name.to_string(),
            provider_id: format!("fake://{name}"),
            kubelet_version: "v1.13.5".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            addresses: vec![fleetforge_core::NodeAddress::new(
                fleetforge_core::AddressType::ExternalIp,
                "203.0.113.10",
            )],
        }
    }

    impl Fixture {
        fn manager(&self) -> UpgradeManager {
            UpgradeManager::new(
                self.store.clone(),
                self.cluster.clone(),
                Arc::new(self.cloud.clone()),
                Arc::new(self.kube.clone()),
                Arc::new(self.executor.clone()),
            )
            .with_poll(PollConfig::new(Duration::from_secs(1), Duration::from_secs(30)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_upgrade_master_then_nodes() {
        let f = fixture("v1.13.6").await;
        f.kube.add_node(kube_node("demo-master-0", &[(ROLE_MASTER_LABEL, "")]));
        f.kube.add_node(kube_node("pool-a-1", &[(ROLE_NODE_LABEL, ""), (NODE_GROUP_LABEL, "pool-a")]));
        f.kube.add_node(kube_node("pool-a-2", &[(ROLE_NODE_LABEL, ""), (NODE_GROUP_LABEL, "pool-a")]));

        let acts = f.manager().apply(false).await.unwrap();
        assert_eq!(acts.len(), 2);
        assert_eq!(acts[0].resource, "Master upgrade");
        assert_eq!(acts[1].message, "Node group will be upgraded to v1.13.6");

        let commands = f.executor.commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].0, "demo-master-0");
        assert!(commands[0].1.contains("apt-get upgrade -y kubelet kubectl"));
        assert!(commands[0].1.contains("kubeadm upgrade apply v1.13.6 -y"));
        assert!(commands[1].1.contains("systemctl restart kubelet"));
        assert!(!commands[1].1.contains("kubeadm"));

        let ng: NodeGroup = f.store.get("demo", "pool-a").await.unwrap();
        assert_eq!(ng.spec.template.kubelet_version, "v1.13.6");
    }

    #[tokio::test(start_paused = true)]
    async fn test_minor_upgrade_uses_kubeadm_on_nodes() {
        let f = fixture("v1.14.0").await;
        f.kube.add_node(kube_node("demo-master-0", &[(ROLE_MASTER_LABEL, "")]));
        f.kube.add_node(kube_node("pool-a-1", &[(NODE_GROUP_LABEL, "pool-a")]));

        f.manager().apply(false).await.unwrap();

        let commands = f.executor.commands();
        assert!(!commands[0].1.contains("apt-get upgrade"));
        assert!(commands[1].1.contains("kubeadm upgrade node"));
    }

    #[tokio::test]
    async fn test_dry_run_runs_nothing() {
        let f = fixture("v1.13.6").await;
        let acts = f.manager().apply(true).await.unwrap();
        assert_eq!(acts.len(), 2);
        assert!(f.executor.commands().is_empty());
    }

    #[tokio::test]
    async fn test_master_topology_errors() {
        let f = fixture("v1.13.6").await;
        let err = f.manager().apply(false).await.unwrap_err();
        assert_eq!(err.to_string(), "no master found");

        f.kube.add_node(kube_node("m-0", &[(ROLE_MASTER_LABEL, "")]));
        f.kube.add_node(kube_node("m-1", &[(ROLE_MASTER_LABEL, "")]));
        let err = f.manager().apply(false).await.unwrap_err();
        assert!(matches!(err, CloudError::Topology(ref m) if m == "multiple master found"));
        assert!(f.executor.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_aborts() {
        let f = fixture("v1.13.6").await;
        f.kube.add_node(kube_node("demo-master-0", &[(ROLE_MASTER_LABEL, "")]));
        f.executor.fail_on("demo-master-0");

        let err = f.manager().apply(false).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to upgrade demo-master-0"));
    }
}
