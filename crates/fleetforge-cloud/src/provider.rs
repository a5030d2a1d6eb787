//! Cloud backend contract
//!
//! Every backend implements [`CloudManager`] (cluster-level capabilities) and
//! hands out an [`InstanceManager`] (per-machine capabilities). The engine
//! never branches on which backend it is talking to.

use crate::certs::{self, Certificates};
use crate::error::{CloudError, Result, ResultExt};
use crate::kube::{KubeClient, KubeConnector, KubeEndpoint};
use crate::remote::SshConfig;
use async_trait::async_trait;
use fleetforge_core::{Cluster, Credential, Machine, MachineRole, Node, NodeGroup, Store};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A freshly created instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// Stable identifier, matches the Kubernetes node's `spec.providerID`
    pub provider_id: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

/// Cluster-level capabilities of a cloud backend
#[async_trait]
pub trait CloudManager: Send + Sync {
    /// Registry key, e.g. "sakura"
    fn name(&self) -> &str;

    /// Control plane run by the cloud itself: no master machines to create.
    fn is_managed(&self) -> bool {
        false
    }

    /// Fills provider defaults into a cluster about to be created.
    fn apply_defaults(&self, _cluster: &mut Cluster) -> Result<()> {
        Ok(())
    }

    /// Idempotent pre-flight setup (SSH key import and the like).
    async fn prepare_cloud(&self, cluster: &mut Cluster) -> Result<()>;

    /// Creates the master instance unless it already exists; records API endpoints on `cluster`.
    async fn ensure_master(&self, cluster: &mut Cluster, machine: &Machine) -> Result<()>;

    fn default_machine_provider_spec(
        &self,
        cluster: &Cluster,
        sku: &str,
        role: MachineRole,
    ) -> Result<serde_json::Value>;

    /// Master size for a cluster with `total_nodes` workers.
    fn master_sku(&self, total_nodes: u32) -> String;

    /// Installs cloud credentials (cloud-config / CCM secrets) into the new cluster.
    async fn create_credentials(&self, cluster: &Cluster, client: &dyn KubeClient) -> Result<()>;

    /// Cached admin client for the cluster.
    async fn admin_client(&self, cluster: &Cluster) -> Result<Arc<dyn KubeClient>>;

    /// Tears down master instances and any other provider resources.
    async fn apply_delete(&self, cluster: &mut Cluster) -> Result<()>;

    /// Manifest bundle for the provider's cluster-api controller.
    fn cluster_api_components(&self, cluster: &Cluster) -> Result<String>;

    fn instance_manager(&self) -> Arc<dyn InstanceManager>;

    /// SSH access to a node for remote upgrades.
    fn ssh_config(&self, cluster: &Cluster, node: &Node) -> Result<SshConfig>;
}

/// Per-instance capabilities of a cloud backend
#[async_trait]
pub trait InstanceManager: Send + Sync {
    async fn create_instance(
        &self,
        cluster: &Cluster,
        name: &str,
        token: &str,
        node_group: &NodeGroup,
    ) -> Result<NodeInfo>;

    async fn delete_instance_by_provider_id(&self, provider_id: &str) -> Result<()>;

    /// Runs before new instances are added to `node_group`.
    async fn prepare_node_group(&self, _node_group: &NodeGroup) -> Result<()> {
        Ok(())
    }

    /// Runs once `node_group` has scaled to zero.
    async fn cleanup_node_group(&self, _node_group: &NodeGroup) -> Result<()> {
        Ok(())
    }
}

/// What a backend factory receives
#[derive(Clone)]
pub struct ProviderContext {
    pub store: Store,
    pub kube: Arc<dyn KubeConnector>,
    pub credential: Option<Credential>,
    pub certs: Option<Arc<Certificates>>,
}

impl ProviderContext {
    pub fn new(store: Store, kube: Arc<dyn KubeConnector>) -> Self {
        Self {
            store,
            kube,
            credential: None,
            certs: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_certs(mut self, certs: Arc<Certificates>) -> Self {
        self.certs = Some(certs);
        self
    }

    pub fn certs(&self) -> Result<&Certificates> {
        self.certs
            .as_deref()
            .ok_or_else(|| CloudError::Validation("cluster certificates are not loaded".into()))
    }

    pub fn credential(&self) -> Result<&Credential> {
        self.credential
            .as_ref()
            .ok_or_else(|| CloudError::Validation("cloud credential is not loaded".into()))
    }

    /// Admin client cache bound to this context's connector and CA.
    pub fn admin_client_cache(&self) -> AdminClientCache {
        AdminClientCache::new(self.kube.clone(), self.certs.clone())
    }
}

/// Lazily built, admin-certificate-authenticated client for one cluster
pub struct AdminClientCache {
    connector: Arc<dyn KubeConnector>,
    certs: Option<Arc<Certificates>>,
    client: OnceCell<Arc<dyn KubeClient>>,
}

impl AdminClientCache {
    pub fn new(connector: Arc<dyn KubeConnector>, certs: Option<Arc<Certificates>>) -> Self {
        Self {
            connector,
            certs,
            client: OnceCell::new(),
        }
    }

    pub async fn get(&self, cluster: &Cluster) -> Result<Arc<dyn KubeClient>> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let certs = self.certs.as_deref().ok_or_else(|| {
                    CloudError::Validation("cluster certificates are not loaded".into())
                })?;
                let server = cluster.api_server_url().ok_or_else(|| {
                    CloudError::Validation(format!(
                        "cluster `{}` has no API endpoint yet",
                        cluster.name()
                    ))
                })?;
                let admin = certs::create_admin_certificate(&certs.ca)?;
                let endpoint = KubeEndpoint {
                    cluster_name: cluster.kubeconfig_cluster_name(),
                    user_name: cluster.kubeconfig_user_name(),
                    server,
                    ca_pem: certs.ca.cert_pem.clone(),
                    client_cert_pem: admin.cert_pem,
                    client_key_pem: admin.key_pem,
                };
                self.connector
                    .connect(&endpoint)
                    .await
                    .with_context(|| format!("failed to connect to cluster `{}`", cluster.name()))
            })
            .await?;
        Ok(client.clone())
    }
}
