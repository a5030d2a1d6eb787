//! Cluster apply state machine
//!
//! One pass loads the cluster, picks the flow matching its phase and runs it:
//!
//! ```text
//!  Pending ──create──▶ Ready ──upgrade──▶ Upgrading ──▶ Ready
//!     │                  │                    │
//!     └──────────────────┴──────delete────────┴──▶ Deleting ──▶ Deleted
//! ```
//!
//! The phase doubles as the resume point: it is persisted right after each
//! irreversible step, so an interrupted pass picks up where it stopped.

use crate::action::{Action, ActionType};
use crate::certs;
use crate::error::{CloudError, Result, ResultExt};
use crate::kube::{KUBE_SYSTEM, KubeClient, KubeConnector};
use crate::node_group::NodeGroupManager;
use crate::provider::{CloudManager, ProviderContext};
use crate::registry::CloudRegistry;
use crate::remote::RemoteExecutor;
use crate::token::TokenConfig;
use crate::upgrade::UpgradeManager;
use crate::wait::{self, PollConfig};
use fleetforge_core::{
    Cluster, ClusterPhase, Credential, KubeVersion, Machine, MachineRole, NodeGroup, Store,
};
use std::sync::Arc;

pub const CLUSTER_API_VERSION: &str = "cluster.k8s.io/v1alpha1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub cluster_name: String,
    pub dry_run: bool,
}

impl ApplyOptions {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Timeouts and token policy for one engine instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSettings {
    /// Master readiness after creation
    pub poll: PollConfig,
    /// Master version convergence during upgrade
    pub upgrade_poll: PollConfig,
    pub token: TokenConfig,
}

pub struct ClusterApplier {
    store: Store,
    registry: CloudRegistry,
    kube: Arc<dyn KubeConnector>,
    executor: Arc<dyn RemoteExecutor>,
    settings: EngineSettings,
}

impl ClusterApplier {
    pub fn new(
        store: Store,
        registry: CloudRegistry,
        kube: Arc<dyn KubeConnector>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            store,
            registry,
            kube,
            executor,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Runs one reconciliation pass and returns what it did (or would do).
    ///
    /// A `Deleted` cluster yields an empty list. On failure the error text is
    /// recorded in `status.reason` unless this is a dry run.
    pub async fn apply(&self, opts: &ApplyOptions) -> Result<Vec<Action>> {
        let cluster: Cluster = self
            .store
            .get("", &opts.cluster_name)
            .await
            .with_context(|| format!("failed to load cluster {}", opts.cluster_name))?;

        match cluster.phase() {
            ClusterPhase::Unknown => {
                return Err(CloudError::UnknownPhase(cluster.name().to_string()));
            }
            ClusterPhase::Deleted => {
                tracing::info!(cluster = %cluster.name(), "cluster is already deleted, ignoring");
                return Ok(Vec::new());
            }
            ClusterPhase::Upgrading => {
                return Err(CloudError::Upgrading(cluster.name().to_string()));
            }
            _ => {}
        }

        let result = self.reconcile(cluster, opts.dry_run).await;
        if let Err(e) = &result {
            tracing::error!(cluster = %opts.cluster_name, "apply failed: {e}");
            if !opts.dry_run {
                self.record_failure(&opts.cluster_name, e).await;
            }
        }
        result
    }

    async fn reconcile(&self, mut cluster: Cluster, dry_run: bool) -> Result<Vec<Action>> {
        let cloud = self.cloud_manager(&cluster).await?;
        let mut acts = Vec::new();

        if cluster.metadata.is_deleting() || cluster.phase() == ClusterPhase::Deleting {
            acts.extend(self.apply_delete(&mut cluster, cloud.as_ref(), dry_run).await?);
        } else if cluster.phase() == ClusterPhase::Pending {
            acts.extend(self.apply_create(&mut cluster, cloud.as_ref(), dry_run).await?);
            acts.extend(self.apply_scale(&cluster, cloud.as_ref(), dry_run).await?);
        } else if self.upgrade_pending(&cluster, cloud.as_ref()).await? {
            acts.extend(self.apply_upgrade(&mut cluster, cloud, dry_run).await?);
        } else {
            acts.extend(self.apply_scale(&cluster, cloud.as_ref(), dry_run).await?);
        }

        tracing::info!(cluster = %cluster.name(), actions = acts.len(), dry_run, "applied cluster");
        Ok(acts)
    }

    async fn cloud_manager(&self, cluster: &Cluster) -> Result<Arc<dyn CloudManager>> {
        let mut ctx = ProviderContext::new(self.store.clone(), self.kube.clone());

        let credential_name = &cluster.config.credential_name;
        if !credential_name.is_empty() {
            let credential: Credential = self
                .store
                .get("", credential_name)
                .await
                .with_context(|| format!("failed to load credential {credential_name}"))?;
            ctx = ctx.with_credential(credential);
        }

        let certs = certs::get_certs(&self.store, cluster.name()).await?;
        ctx = ctx.with_certs(Arc::new(certs));

        self.registry
            .cloud_manager(&cluster.config.cloud.cloud_provider, ctx)
    }

    async fn save(&self, cluster: &mut Cluster) -> Result<()> {
        *cluster = self
            .store
            .update(cluster)
            .await
            .with_context(|| format!("failed to update cluster {}", cluster.name()))?;
        Ok(())
    }

    async fn save_status(&self, cluster: &mut Cluster) -> Result<()> {
        *cluster = self
            .store
            .update_status(cluster)
            .await
            .with_context(|| format!("failed to update status of cluster {}", cluster.name()))?;
        Ok(())
    }

    async fn record_failure(&self, name: &str, err: &CloudError) {
        let latest: Option<Cluster> = match self.store.find("", name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(cluster = %name, "failed to reload cluster: {e}");
                return;
            }
        };
        if let Some(mut cluster) = latest {
            cluster.status.reason = err.to_string();
            if let Err(e) = self.store.update_status(&cluster).await {
                tracing::warn!(cluster = %name, "failed to record failure reason: {e}");
            }
        }
    }

    async fn master_machines(&self, cluster: &Cluster) -> Result<Vec<Machine>> {
        let machines: Vec<Machine> = self.store.list(cluster.name()).await?;
        Ok(machines.into_iter().filter(Machine::is_master).collect())
    }

    async fn worker_groups(&self, cluster: &Cluster) -> Result<Vec<NodeGroup>> {
        let groups: Vec<NodeGroup> = self.store.list(cluster.name()).await?;
        Ok(groups.into_iter().filter(|ng| !ng.is_master()).collect())
    }

    async fn apply_create(
        &self,
        cluster: &mut Cluster,
        cloud: &dyn CloudManager,
        dry_run: bool,
    ) -> Result<Vec<Action>> {
        let name = cluster.name().to_string();
        let masters = self.master_machines(cluster).await?;
        let mut acts = Vec::new();

        if !cloud.is_managed() {
            let leader = leader_name(&name);
            acts.push(Action::new(
                ActionType::Add,
                "Master instance",
                format!("Master instance {leader} will be created"),
            ));
        }
        acts.push(Action::new(
            ActionType::Add,
            "Cloud credential",
            format!("Cloud credential will be installed in cluster {name}"),
        ));
        if !cloud.is_managed() {
            acts.push(Action::new(
                ActionType::Add,
                "Cluster API",
                format!("{} master machine(s) will be registered with cluster-api", masters.len()),
            ));
        }
        if dry_run {
            return Ok(acts);
        }

        cloud
            .prepare_cloud(cluster)
            .await
            .context("failed to prepare cloud infrastructure")?;
        self.save(cluster).await?;

        if !cloud.is_managed() {
            self.set_master_sku(cluster, cloud, &masters).await?;

            let leader: Machine = self
                .store
                .get(&name, &leader_name(&name))
                .await
                .context("failed to get leader machine")?;
            cloud
                .ensure_master(cluster, &leader)
                .await
                .context("failed to create master machine")?;
            self.save(cluster).await?;
        }

        let client = cloud
            .admin_client(cluster)
            .await
            .context("failed to get admin client")?;
        wait::wait_for_ready_master(client.as_ref(), &self.settings.poll).await?;

        cloud
            .create_credentials(cluster, client.as_ref())
            .await
            .context("failed to create cloud credential")?;

        // managed control planes run their own controllers
        if !cloud.is_managed() {
            let components = cloud.cluster_api_components(cluster)?;
            client
                .apply_manifests(&components)
                .await
                .context("failed to install cluster-api components")?;

            let masters = self.master_machines(cluster).await?;
            if !masters.is_empty() {
                client
                    .apply_manifests(&machine_manifests(&masters)?)
                    .await
                    .context("failed to register master machines")?;
            }
        }

        cluster.status.cluster_uid = client
            .namespace_uid(KUBE_SYSTEM)
            .await
            .context("failed to read cluster uid")?;
        cluster.status.reason.clear();
        cluster.transition_to(ClusterPhase::Ready)?;
        self.save_status(cluster).await?;

        Ok(acts)
    }

    /// Sizes every master for the total worker count.
    async fn set_master_sku(
        &self,
        cluster: &Cluster,
        cloud: &dyn CloudManager,
        masters: &[Machine],
    ) -> Result<()> {
        let total: u32 = self
            .worker_groups(cluster)
            .await?
            .iter()
            .map(|ng| ng.spec.nodes)
            .sum();
        let sku = cloud.master_sku(total);
        tracing::debug!(cluster = %cluster.name(), total, %sku, "master sku");

        for machine in masters {
            let mut machine = machine.clone();
            machine.spec.provider_spec =
                cloud.default_machine_provider_spec(cluster, &sku, MachineRole::Master)?;
            self.store
                .update(&machine)
                .await
                .with_context(|| format!("failed to update machine {}", machine.name()))?;
        }
        Ok(())
    }

    async fn optional_client(
        &self,
        cluster: &Cluster,
        cloud: &dyn CloudManager,
    ) -> Result<Option<Arc<dyn KubeClient>>> {
        if cluster.api_server_url().is_none() {
            return Ok(None);
        }
        Ok(Some(cloud.admin_client(cluster).await?))
    }

    async fn apply_scale(
        &self,
        cluster: &Cluster,
        cloud: &dyn CloudManager,
        dry_run: bool,
    ) -> Result<Vec<Action>> {
        let client = self.optional_client(cluster, cloud).await?;
        let mut acts = Vec::new();
        for ng in self.worker_groups(cluster).await? {
            let mut manager = NodeGroupManager::new(
                self.store.clone(),
                cluster.clone(),
                ng,
                cloud.instance_manager(),
                client.clone(),
            )
            .with_token_config(self.settings.token);
            acts.extend(manager.apply(dry_run).await?);
        }
        Ok(acts)
    }

    async fn upgrade_pending(&self, cluster: &Cluster, cloud: &dyn CloudManager) -> Result<bool> {
        if cluster.phase() != ClusterPhase::Ready {
            return Ok(false);
        }
        let desired = KubeVersion::parse(&cluster.config.kubernetes_version)?;
        let client = cloud.admin_client(cluster).await?;
        let running = client
            .server_version()
            .await
            .context("failed to read server version")?;
        let running = KubeVersion::parse(&running)?;
        Ok(running < desired)
    }

    async fn apply_upgrade(
        &self,
        cluster: &mut Cluster,
        cloud: Arc<dyn CloudManager>,
        dry_run: bool,
    ) -> Result<Vec<Action>> {
        if !dry_run {
            cluster.transition_to(ClusterPhase::Upgrading)?;
            self.save_status(cluster).await?;
        }

        let client = cloud.admin_client(cluster).await?;
        let acts = UpgradeManager::new(
            self.store.clone(),
            cluster.clone(),
            cloud,
            client,
            self.executor.clone(),
        )
        .with_poll(self.settings.upgrade_poll)
        .apply(dry_run)
        .await?;

        if !dry_run {
            cluster.status.reason.clear();
            cluster.transition_to(ClusterPhase::Ready)?;
            self.save_status(cluster).await?;
        }
        Ok(acts)
    }

    async fn apply_delete(
        &self,
        cluster: &mut Cluster,
        cloud: &dyn CloudManager,
        dry_run: bool,
    ) -> Result<Vec<Action>> {
        let name = cluster.name().to_string();

        if !dry_run && cluster.phase() != ClusterPhase::Deleting {
            cluster.metadata.mark_deleted();
            cluster.transition_to(ClusterPhase::Deleting)?;
            self.save(cluster).await?;
        }

        let client = match self.optional_client(cluster, cloud).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(cluster = %name, "API server unreachable, skipping node drain: {e}");
                None
            }
        };

        let mut acts = Vec::new();
        for mut ng in self.worker_groups(cluster).await? {
            ng.spec.nodes = 0;
            ng.metadata.mark_deleted();
            if !dry_run {
                ng = self
                    .store
                    .update(&ng)
                    .await
                    .with_context(|| format!("failed to update node group {}", ng.name()))?;
            }
            let mut manager = NodeGroupManager::new(
                self.store.clone(),
                cluster.clone(),
                ng,
                cloud.instance_manager(),
                client.clone(),
            )
            .with_token_config(self.settings.token);
            acts.extend(manager.apply(dry_run).await?);
        }

        acts.push(Action::new(
            ActionType::Delete,
            "Cluster",
            format!("Cluster {name} will be deleted"),
        ));
        if dry_run {
            return Ok(acts);
        }

        cloud
            .apply_delete(cluster)
            .await
            .context("failed to delete cloud resources")?;

        for machine in self.master_machines(cluster).await? {
            self.store
                .delete::<Machine>(&name, machine.name())
                .await
                .with_context(|| format!("failed to delete machine {}", machine.name()))?;
        }

        cluster.status.reason.clear();
        cluster.transition_to(ClusterPhase::Deleted)?;
        self.save_status(cluster).await?;
        tracing::info!(cluster = %name, "cluster deleted");

        Ok(acts)
    }
}

/// The master that bootstraps the control plane.
pub fn leader_name(cluster: &str) -> String {
    format!("{cluster}-master-0")
}

/// cluster-api `Machine` documents for `machines`, one YAML document each.
pub fn machine_manifests(machines: &[Machine]) -> Result<String> {
    let mut docs = Vec::with_capacity(machines.len());
    for machine in machines {
        let doc = serde_json::json!({
            "apiVersion": CLUSTER_API_VERSION,
            "kind": "Machine",
            "metadata": {
                "name": machine.name(),
                "namespace": "default",
                "labels": machine.metadata.labels,
            },
            "spec": {
                "providerSpec": { "value": machine.spec.provider_spec },
                "versions": {
                    "kubelet": machine.spec.versions.kubelet,
                    "controlPlane": machine.spec.versions.control_plane,
                },
            },
        });
        docs.push(serde_yaml::to_string(&doc)?);
    }
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_machine_manifests() {
        let machines = vec![
            Machine::master("demo", 0, "v1.13.5"),
            Machine::master("demo", 1, "v1.13.5"),
        ];
        let yaml = machine_manifests(&machines).unwrap();

        let docs: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&yaml)
            .map(serde_yaml::Value::deserialize)
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["apiVersion"].as_str(), Some(CLUSTER_API_VERSION));
        assert_eq!(docs[1]["metadata"]["name"].as_str(), Some("demo-master-1"));
        assert_eq!(
            docs[0]["spec"]["versions"]["controlPlane"].as_str(),
            Some("v1.13.5")
        );
    }

    #[test]
    fn test_leader_name() {
        assert_eq!(leader_name("demo"), "demo-master-0");
    }
}
