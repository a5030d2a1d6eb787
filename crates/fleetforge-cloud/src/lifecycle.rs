//! Record-level cluster commands
//!
//! These only write the desired state; the next apply pass acts on it.

use crate::certs;
use crate::error::{CloudError, Result, ResultExt};
use crate::kube::KubeConnector;
use crate::provider::{CloudManager, ProviderContext};
use crate::registry::CloudRegistry;
use fleetforge_core::{
    Cluster, ClusterConfig, ClusterPhase, CoreError, Credential, KubeVersion, Machine,
    MachineRole, NodeGroup, Store,
};
use std::sync::Arc;

/// Input of [`ClusterLifecycle::create_cluster`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewCluster {
    pub name: String,
    pub provider: String,
    pub zone: String,
    pub kubernetes_version: String,
    pub master_count: u32,
    pub credential_name: String,
}

/// Input of [`ClusterLifecycle::create_node_group`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewNodeGroup {
    pub cluster: String,
    /// Defaults to `<sku>-pool`
    pub name: Option<String>,
    pub sku: String,
    pub nodes: u32,
}

pub struct ClusterLifecycle {
    store: Store,
    registry: CloudRegistry,
    kube: Arc<dyn KubeConnector>,
}

impl ClusterLifecycle {
    pub fn new(store: Store, registry: CloudRegistry, kube: Arc<dyn KubeConnector>) -> Self {
        Self {
            store,
            registry,
            kube,
        }
    }

    fn cloud_manager(
        &self,
        provider: &str,
        credential: Option<Credential>,
    ) -> Result<Arc<dyn CloudManager>> {
        let mut ctx = ProviderContext::new(self.store.clone(), self.kube.clone());
        if let Some(credential) = credential {
            ctx = ctx.with_credential(credential);
        }
        self.registry.cloud_manager(provider, ctx)
    }

    async fn credential(&self, name: &str) -> Result<Option<Credential>> {
        if name.is_empty() {
            return Ok(None);
        }
        let credential = self
            .store
            .get("", name)
            .await
            .with_context(|| format!("failed to load credential {name}"))?;
        Ok(Some(credential))
    }

    async fn cloud_for(&self, cluster: &Cluster) -> Result<Arc<dyn CloudManager>> {
        let credential = self.credential(&cluster.config.credential_name).await?;
        self.cloud_manager(&cluster.config.cloud.cloud_provider, credential)
    }

    pub async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        Ok(self.store.get("", name).await?)
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.store.list("").await?)
    }

    pub async fn list_node_groups(&self, cluster: &str) -> Result<Vec<NodeGroup>> {
        Ok(self.store.list(cluster).await?)
    }

    /// Records a new `Pending` cluster with its trust material and master machines.
    pub async fn create_cluster(&self, req: NewCluster) -> Result<Cluster> {
        if req.name.is_empty() {
            return Err(CloudError::Validation("missing cluster name".into()));
        }
        if req.kubernetes_version.is_empty() {
            return Err(CloudError::Validation("missing cluster version".into()));
        }
        KubeVersion::parse(&req.kubernetes_version)?;
        if req.master_count == 0 {
            return Err(CloudError::Validation("at least one master is required".into()));
        }
        if self.store.find::<Cluster>("", &req.name).await?.is_some() {
            return Err(CoreError::AlreadyExists {
                kind: "cluster",
                name: req.name,
            }
            .into());
        }

        let credential = self.credential(&req.credential_name).await?;
        if let Some(credential) = &credential {
            if credential.provider != req.provider {
                return Err(CloudError::Validation(format!(
                    "credential {} is for provider {}, not {}",
                    req.credential_name, credential.provider, req.provider
                )));
            }
        }
        let cloud = self.cloud_manager(&req.provider, credential)?;

        let mut config = ClusterConfig {
            master_count: req.master_count,
            kubernetes_version: req.kubernetes_version.clone(),
            credential_name: req.credential_name,
            ..Default::default()
        };
        config.cloud.cloud_provider = req.provider;
        config.cloud.zone = req.zone;
        config.cloud.ssh_key_name = certs::ssh_key_name(&req.name);

        let mut cluster = Cluster::new(req.name.clone(), config);
        cluster.status.phase = ClusterPhase::Pending;
        cloud.apply_defaults(&mut cluster)?;

        // cluster record last, so a failed attempt never blocks a retry
        certs::create_certs_keys(&self.store, cluster.name()).await?;

        let mut masters = Vec::new();
        if !cloud.is_managed() {
            let sku = cloud.master_sku(0);
            for index in 0..cluster.config.master_count {
                let mut machine =
                    Machine::master(cluster.name(), index, &cluster.config.kubernetes_version);
                machine.spec.provider_spec =
                    cloud.default_machine_provider_spec(&cluster, &sku, MachineRole::Master)?;
                masters.push(machine);
            }
        }
        self.clear_orphan_machines(cluster.name()).await?;
        for machine in &masters {
            self.store
                .create(machine)
                .await
                .with_context(|| format!("failed to create machine {}", machine.name()))?;
        }

        let cluster = self
            .store
            .create(&cluster)
            .await
            .with_context(|| format!("failed to create cluster {}", req.name))?;

        tracing::info!(cluster = %cluster.name(), provider = %cluster.config.cloud.cloud_provider, "cluster created");
        Ok(cluster)
    }

    /// Machines left behind by an earlier attempt that never wrote its cluster.
    async fn clear_orphan_machines(&self, cluster: &str) -> Result<()> {
        for machine in self.store.list::<Machine>(cluster).await? {
            tracing::warn!(cluster, machine = %machine.name(), "removing leftover machine");
            self.store
                .delete::<Machine>(cluster, machine.name())
                .await
                .with_context(|| format!("failed to delete machine {}", machine.name()))?;
        }
        Ok(())
    }

    pub async fn create_node_group(&self, req: NewNodeGroup) -> Result<NodeGroup> {
        if req.sku.is_empty() {
            return Err(CloudError::Validation("missing node sku".into()));
        }
        let cluster = self.get_cluster(&req.cluster).await?;
        let cloud = self.cloud_for(&cluster).await?;

        let name = req
            .name
            .unwrap_or_else(|| NodeGroup::name_for_sku(&req.sku));
        let mut ng = NodeGroup::new(cluster.name(), name, req.sku.clone(), req.nodes);
        ng.spec.template.provider_spec =
            cloud.default_machine_provider_spec(&cluster, &req.sku, MachineRole::Node)?;
        ng.spec.template.kubelet_version = cluster.config.kubernetes_version.clone();

        let ng = self
            .store
            .create(&ng)
            .await
            .with_context(|| format!("failed to create node group {}", ng.name()))?;
        tracing::info!(cluster = %cluster.name(), node_group = %ng.name(), nodes = ng.spec.nodes, "node group created");
        Ok(ng)
    }

    /// Changes the desired replica count of a node group.
    pub async fn scale_node_group(&self, cluster: &str, name: &str, nodes: u32) -> Result<NodeGroup> {
        let mut ng: NodeGroup = self.store.get(cluster, name).await?;
        if ng.metadata.is_deleting() {
            return Err(CloudError::Validation(format!(
                "node group {name} is being deleted"
            )));
        }
        ng.spec.nodes = nodes;
        Ok(self.store.update(&ng).await?)
    }

    /// Marks a cluster for deletion; the next apply tears it down.
    pub async fn delete_cluster(&self, name: &str) -> Result<Cluster> {
        let mut cluster = self.get_cluster(name).await?;
        if cluster.phase() == ClusterPhase::Deleted {
            return Ok(cluster);
        }
        cluster.metadata.mark_deleted();
        cluster.transition_to(ClusterPhase::Deleting)?;
        let cluster = self
            .store
            .update(&cluster)
            .await
            .with_context(|| format!("failed to update cluster {name}"))?;
        tracing::info!(cluster = %name, "cluster marked for deletion");
        Ok(cluster)
    }

    /// Marks a node group for deletion; the next apply drains and removes it.
    pub async fn delete_node_group(&self, cluster: &str, name: &str) -> Result<NodeGroup> {
        let mut ng: NodeGroup = self.store.get(cluster, name).await?;
        ng.spec.nodes = 0;
        ng.metadata.mark_deleted();
        let ng = self
            .store
            .update(&ng)
            .await
            .with_context(|| format!("failed to update node group {name}"))?;
        tracing::info!(cluster, node_group = %name, "node group marked for deletion");
        Ok(ng)
    }

    /// Sets the desired Kubernetes version; the next apply upgrades to it.
    pub async fn edit_cluster_version(&self, name: &str, version: &str) -> Result<Cluster> {
        let desired = KubeVersion::parse(version)?;
        let mut cluster = self.get_cluster(name).await?;
        if cluster.metadata.is_deleting() {
            return Err(CloudError::Validation(format!(
                "cluster {name} is being deleted"
            )));
        }
        if let Ok(current) = KubeVersion::parse(&cluster.config.kubernetes_version) {
            if desired < current {
                return Err(CloudError::Validation(format!(
                    "cannot downgrade cluster {name} from {current} to {desired}"
                )));
            }
        }
        cluster.config.kubernetes_version = version.to_string();
        Ok(self.store.update(&cluster).await?)
    }

    /// Returns a cluster stuck in `Upgrading` to `Ready`.
    ///
    /// A failed upgrade is never rolled back; once the nodes are repaired by
    /// hand this lets the next apply pass run again and retry the upgrade.
    /// The failure reason is kept.
    pub async fn abort_upgrade(&self, name: &str) -> Result<Cluster> {
        let mut cluster = self.get_cluster(name).await?;
        if cluster.phase() != ClusterPhase::Upgrading {
            return Err(CloudError::Validation(format!(
                "cluster {name} is not upgrading (phase {})",
                cluster.phase()
            )));
        }
        cluster.transition_to(ClusterPhase::Ready)?;
        let cluster = self
            .store
            .update_status(&cluster)
            .await
            .with_context(|| format!("failed to update cluster {name}"))?;
        tracing::warn!(cluster = %name, "upgrade aborted, cluster returned to Ready");
        Ok(cluster)
    }

    pub async fn create_credential(&self, credential: Credential) -> Result<Credential> {
        if credential.metadata.name.is_empty() {
            return Err(CloudError::Validation("missing credential name".into()));
        }
        if credential.provider.is_empty() {
            return Err(CloudError::Validation("missing credential provider".into()));
        }
        Ok(self.store.create(&credential).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCloud, FakeKube};
    use fleetforge_core::{CertificateRecord, ROLE_MASTER_LABEL};

    fn lifecycle() -> (ClusterLifecycle, Store) {
        let store = Store::in_memory();
        let kube = FakeKube::new("v1.13.5");
        let cloud = FakeCloud::new(kube.clone());
        let registry = CloudRegistry::new().with("fake", cloud.factory());
        (
            ClusterLifecycle::new(store.clone(), registry, Arc::new(kube)),
            store,
        )
    }

    fn demo() -> NewCluster {
        NewCluster {
            name: "demo".to_string(),
            provider: "fake".to_string(),
            zone: "is1a".to_string(),
            kubernetes_version: "v1.13.5".to_string(),
            master_count: 3,
            credential_name: String::new(),
        }
    }

    #[tokio::test]
    async fn test_create_cluster_records_everything() {
        let (lc, store) = lifecycle();
        let cluster = lc.create_cluster(demo()).await.unwrap();

        assert_eq!(cluster.phase(), ClusterPhase::Pending);
        assert_eq!(cluster.config.cloud.ssh_key_name, "demo-sshkey");

        let machines: Vec<Machine> = store.list("demo").await.unwrap();
        let names: Vec<_> = machines.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["demo-master-0", "demo-master-1", "demo-master-2"]);
        assert!(machines.iter().all(|m| m.metadata.labels.contains_key(ROLE_MASTER_LABEL)));

        let certs: Vec<CertificateRecord> = store.list("demo").await.unwrap();
        assert_eq!(certs.len(), 4);
    }

    #[tokio::test]
    async fn test_create_cluster_validation_has_no_side_effects() {
        let (lc, store) = lifecycle();

        let err = lc
            .create_cluster(NewCluster {
                kubernetes_version: String::new(),
                ..demo()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));

        let err = lc
            .create_cluster(NewCluster {
                kubernetes_version: "latest".to_string(),
                ..demo()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("latest"));

        let err = lc
            .create_cluster(NewCluster {
                provider: "nope".to_string(),
                ..demo()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::ProviderNotFound(_)));

        assert!(store.list::<Cluster>("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leftover_machines_do_not_block_create() {
        let (lc, store) = lifecycle();
        for index in [1, 5] {
            store
                .create(&Machine::master("demo", index, "v1.12.0"))
                .await
                .unwrap();
        }

        lc.create_cluster(demo()).await.unwrap();

        let machines: Vec<Machine> = store.list("demo").await.unwrap();
        let names: Vec<_> = machines.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["demo-master-0", "demo-master-1", "demo-master-2"]);
        assert!(machines.iter().all(|m| m.spec.versions.kubelet == "v1.13.5"));
    }

    #[tokio::test]
    async fn test_failed_create_writes_no_cluster_and_can_retry() {
        let store = Store::in_memory();
        let kube = FakeKube::new("v1.13.5");
        let cloud = FakeCloud::new(kube.clone());
        let registry = CloudRegistry::new().with("fake", cloud.factory());
        let lc = ClusterLifecycle::new(store.clone(), registry, Arc::new(kube));

        cloud.fail_machine_specs(true);
        let err = lc.create_cluster(demo()).await.unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));
        assert!(store.find::<Cluster>("", "demo").await.unwrap().is_none());
        assert!(store.list::<Machine>("demo").await.unwrap().is_empty());

        cloud.fail_machine_specs(false);
        let cluster = lc.create_cluster(demo()).await.unwrap();
        assert_eq!(cluster.phase(), ClusterPhase::Pending);
        assert_eq!(store.list::<Machine>("demo").await.unwrap().len(), 3);
        let certs: Vec<CertificateRecord> = store.list("demo").await.unwrap();
        assert_eq!(certs.len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_cluster_is_a_conflict() {
        let (lc, _) = lifecycle();
        lc.create_cluster(demo()).await.unwrap();
        let err = lc.create_cluster(demo()).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_node_group_defaults() {
        let (lc, _) = lifecycle();
        lc.create_cluster(demo()).await.unwrap();

        let ng = lc
            .create_node_group(NewNodeGroup {
                cluster: "demo".to_string(),
                name: None,
                sku: "2core_4gb".to_string(),
                nodes: 2,
            })
            .await
            .unwrap();
        assert_eq!(ng.name(), "2core-4gb-pool");
        assert_eq!(ng.spec.template.kubelet_version, "v1.13.5");
        assert_eq!(ng.spec.template.provider_spec["sku"], "2core_4gb");

        let ng = lc.scale_node_group("demo", "2core-4gb-pool", 5).await.unwrap();
        assert_eq!(ng.spec.nodes, 5);
        assert_eq!(ng.metadata.generation, 2);
    }

    #[tokio::test]
    async fn test_delete_marks_records() {
        let (lc, _) = lifecycle();
        lc.create_cluster(demo()).await.unwrap();
        lc.create_node_group(NewNodeGroup {
            cluster: "demo".to_string(),
            name: Some("pool-a".to_string()),
            sku: "2core-4gb".to_string(),
            nodes: 3,
        })
        .await
        .unwrap();

        let ng = lc.delete_node_group("demo", "pool-a").await.unwrap();
        assert!(ng.metadata.is_deleting());
        assert_eq!(ng.spec.nodes, 0);

        let cluster = lc.delete_cluster("demo").await.unwrap();
        assert!(cluster.metadata.is_deleting());
        assert_eq!(cluster.phase(), ClusterPhase::Deleting);
    }

    #[tokio::test]
    async fn test_edit_version() {
        let (lc, _) = lifecycle();
        lc.create_cluster(demo()).await.unwrap();

        let cluster = lc.edit_cluster_version("demo", "v1.13.6").await.unwrap();
        assert_eq!(cluster.config.kubernetes_version, "v1.13.6");
        assert_eq!(cluster.metadata.generation, 2);

        assert!(lc.edit_cluster_version("demo", "v1.12.0").await.is_err());
        assert!(lc.edit_cluster_version("demo", "garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_abort_upgrade() {
        let (lc, store) = lifecycle();
        let cluster = lc.create_cluster(demo()).await.unwrap();

        let err = lc.abort_upgrade("demo").await.unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));

        let mut cluster = cluster;
        cluster.status.phase = ClusterPhase::Upgrading;
        cluster.status.reason = "kubeadm upgrade failed".to_string();
        store.update_status(&cluster).await.unwrap();

        let cluster = lc.abort_upgrade("demo").await.unwrap();
        assert_eq!(cluster.phase(), ClusterPhase::Ready);
        assert_eq!(cluster.status.reason, "kubeadm upgrade failed");
        assert_eq!(lc.get_cluster("demo").await.unwrap().phase(), ClusterPhase::Ready);
    }

    #[tokio::test]
    async fn test_credential_provider_must_match() {
        let (lc, _) = lifecycle();
        lc.create_credential(Credential::new("sakura-cred", "sakura").with("token", "t"))
            .await
            .unwrap();

        let err = lc
            .create_cluster(NewCluster {
                credential_name: "sakura-cred".to_string(),
                ..demo()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));
    }
}
