//! In-memory fakes for the Kubernetes, provider and SSH seams
//!
//! Enabled for this crate's own tests and, through the `test-utils` feature,
//! for downstream crates. `FakeCloud` registers every instance it creates as a
//! node in its `FakeKube`, so a full apply pass can run without a cloud.

use crate::error::{CloudError, Result};
use crate::kube::{ComponentHealth, KUBE_SYSTEM, KubeClient, KubeConnector, KubeEndpoint, SecretData};
use crate::provider::{AdminClientCache, CloudManager, InstanceManager, NodeInfo, ProviderContext};
use crate::remote::{RemoteExecutor, SshConfig};
use async_trait::async_trait;
use fleetforge_core::{
    AddressType, Cluster, Machine, MachineRole, NODE_GROUP_LABEL, Node, NodeAddress, NodeGroup,
    ROLE_MASTER_LABEL, ROLE_NODE_LABEL,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

pub const FAKE_CLUSTER_UID: &str = "5f1f6e36-6a0b-4b9e-9d0e-0b1e2f3a4c5d";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct KubeState {
    server_version: String,
    nodes: Vec<Node>,
    secrets: Vec<SecretData>,
    secret_list_failures: u32,
    drain_failures: BTreeSet<String>,
    cordoned: Vec<String>,
    manifests: Vec<String>,
    connections: u32,
}

/// A cluster API server kept in memory
#[derive(Debug, Clone)]
pub struct FakeKube {
    state: Arc<Mutex<KubeState>>,
}

fn matches_selector(node: &Node, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => node.labels.get(key).map(String::as_str) == Some(value),
            None => node.labels.contains_key(term),
        })
}

impl FakeKube {
    pub fn new(server_version: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(KubeState {
                server_version: server_version.to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_server_version(&self, version: &str) {
        lock(&self.state).server_version = version.to_string();
    }

    pub fn add_node(&self, node: Node) -> Node {
        lock(&self.state).nodes.push(node.clone());
        node
    }

    pub fn nodes(&self) -> Vec<Node> {
        lock(&self.state).nodes.clone()
    }

    pub fn nodes_in_group(&self, group: &str) -> Vec<Node> {
        self.nodes()
            .into_iter()
            .filter(|n| n.node_group() == Some(group))
            .collect()
    }

    pub fn set_kubelet_version(&self, node: &str, version: &str) {
        let mut state = lock(&self.state);
        if let Some(n) = state.nodes.iter_mut().find(|n| n.name == node) {
            n.kubelet_version = version.to_string();
        }
    }

    pub fn insert_secret(&self, secret: SecretData) {
        lock(&self.state).secrets.push(secret);
    }

    pub fn secrets(&self) -> Vec<SecretData> {
        lock(&self.state).secrets.clone()
    }

    /// The next `times` secret listings fail.
    pub fn fail_secret_listing(&self, times: u32) {
        lock(&self.state).secret_list_failures = times;
    }

    /// Pod eviction on `node` fails from now on.
    pub fn fail_drain(&self, node: &str) {
        lock(&self.state).drain_failures.insert(node.to_string());
    }

    pub fn cordoned(&self) -> Vec<String> {
        lock(&self.state).cordoned.clone()
    }

    pub fn applied_manifests(&self) -> Vec<String> {
        lock(&self.state).manifests.clone()
    }

    pub fn connections(&self) -> u32 {
        lock(&self.state).connections
    }
}

#[async_trait]
impl KubeConnector for FakeKube {
    async fn connect(&self, endpoint: &KubeEndpoint) -> Result<Arc<dyn KubeClient>> {
        if endpoint.client_cert_pem.is_empty() {
            return Err(CloudError::Certificate("missing client certificate".into()));
        }
        lock(&self.state).connections += 1;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl KubeClient for FakeKube {
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        Ok(lock(&self.state).server_version.clone())
    }

    async fn component_statuses(&self) -> Result<Vec<ComponentHealth>> {
        Ok(["scheduler", "controller-manager", "etcd-0"]
            .into_iter()
            .map(|name| ComponentHealth {
                name: name.to_string(),
                healthy: true,
            })
            .collect())
    }

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        Ok(lock(&self.state)
            .nodes
            .iter()
            .filter(|n| matches_selector(n, label_selector))
            .cloned()
            .collect())
    }

    async fn cordon_node(&self, name: &str) -> Result<()> {
        lock(&self.state).cordoned.push(name.to_string());
        Ok(())
    }

    async fn evict_pods(&self, node: &str) -> Result<()> {
        if lock(&self.state).drain_failures.contains(node) {
            return Err(CloudError::Kube(format!("eviction of pods on {node} timed out")));
        }
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let before = state.nodes.len();
        state.nodes.retain(|n| n.name != name);
        if state.nodes.len() == before {
            return Err(CloudError::Kube(format!("nodes \"{name}\" not found")));
        }
        Ok(())
    }

    async fn list_secrets(&self, _namespace: &str, secret_type: &str) -> Result<Vec<SecretData>> {
        let mut state = lock(&self.state);
        if state.secret_list_failures > 0 {
            state.secret_list_failures -= 1;
            return Err(CloudError::Kube("connection refused".into()));
        }
        Ok(state
            .secrets
            .iter()
            .filter(|s| s.secret_type == secret_type)
            .cloned()
            .collect())
    }

    async fn create_secret(&self, _namespace: &str, secret: &SecretData) -> Result<()> {
        let mut state = lock(&self.state);
        if state.secrets.iter().any(|s| s.name == secret.name) {
            return Err(CloudError::Kube(format!(
                "secrets \"{}\" already exists",
                secret.name
            )));
        }
        state.secrets.push(secret.clone());
        Ok(())
    }

    async fn apply_manifests(&self, manifests: &str) -> Result<()> {
        lock(&self.state).manifests.push(manifests.to_string());
        Ok(())
    }

    async fn namespace_uid(&self, _name: &str) -> Result<String> {
        Ok(FAKE_CLUSTER_UID.to_string())
    }
}

#[derive(Debug, Default)]
struct CloudState {
    events: Vec<String>,
    created: Vec<String>,
    deleted: Vec<String>,
    cleaned: Vec<String>,
    fail_creation: bool,
    fail_machine_specs: bool,
    next_ip: u8,
}

/// A cloud whose instances are nodes of a [`FakeKube`]
#[derive(Clone)]
pub struct FakeCloud {
    kube: FakeKube,
    state: Arc<Mutex<CloudState>>,
    managed: bool,
    admin: Option<Arc<AdminClientCache>>,
}

impl FakeCloud {
    pub const NAME: &'static str = "fake";

    pub fn new(kube: FakeKube) -> Self {
        Self {
            kube,
            state: Arc::new(Mutex::new(CloudState {
                next_ip: 10,
                ..Default::default()
            })),
            managed: false,
            admin: None,
        }
    }

    /// Behaves like a managed control plane: no master machines.
    pub fn managed(mut self) -> Self {
        self.managed = true;
        self
    }

    /// Registry factory sharing this cloud's recorded state.
    pub fn factory(
        &self,
    ) -> impl Fn(ProviderContext) -> Result<Arc<dyn CloudManager>> + Send + Sync + 'static {
        let cloud = self.clone();
        move |ctx: ProviderContext| {
            let mut instance = cloud.clone();
            if ctx.certs.is_some() {
                instance.admin = Some(Arc::new(ctx.admin_client_cache()));
            }
            Ok(Arc::new(instance) as Arc<dyn CloudManager>)
        }
    }

    pub fn fail_instance_creation(&self) {
        lock(&self.state).fail_creation = true;
    }

    /// Makes `default_machine_provider_spec` fail until switched back off.
    pub fn fail_machine_specs(&self, fail: bool) {
        lock(&self.state).fail_machine_specs = fail;
    }

    /// Every provider call, in order.
    pub fn events(&self) -> Vec<String> {
        lock(&self.state).events.clone()
    }

    pub fn created_instances(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    pub fn deleted_instances(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn cleaned_groups(&self) -> Vec<String> {
        lock(&self.state).cleaned.clone()
    }

    fn record(&self, event: String) {
        lock(&self.state).events.push(event);
    }

    fn next_address(&self) -> String {
        let mut state = lock(&self.state);
        state.next_ip = state.next_ip.wrapping_add(1);
        format!("203.0.113.{}", state.next_ip)
    }
}

#[async_trait]
impl CloudManager for FakeCloud {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn is_managed(&self) -> bool {
        self.managed
    }

    async fn prepare_cloud(&self, cluster: &mut Cluster) -> Result<()> {
        self.record(format!("prepare_cloud {}", cluster.name()));
        cluster.status.cloud.ssh_key_external_id = Some(format!("fake-key-{}", cluster.name()));
        if self.managed && cluster.api_server_url().is_none() {
            // the hosted control plane comes with its endpoint
            let address = NodeAddress::new(AddressType::ExternalIp, self.next_address());
            cluster.set_api_endpoints(&[address]);
        }
        Ok(())
    }

    async fn ensure_master(&self, cluster: &mut Cluster, machine: &Machine) -> Result<()> {
        let existing = self
            .kube
            .nodes()
            .into_iter()
            .find(|n| n.name == machine.name());
        let node = match existing {
            Some(node) => node,
            None => {
                self.record(format!("create_master {}", machine.name()));
                let mut labels = BTreeMap::new();
                labels.insert(ROLE_MASTER_LABEL.to_string(), String::new());
                self.kube.add_node(Node {
                    name: machine.name().to_string(),
                    provider_id: format!("fake://{}", machine.name()),
                    kubelet_version: machine.spec.versions.kubelet.clone(),
                    labels,
                    addresses: vec![NodeAddress::new(AddressType::ExternalIp, self.next_address())],
                })
            }
        };
        cluster.set_api_endpoints(&node.addresses);
        Ok(())
    }

    fn default_machine_provider_spec(
        &self,
        _cluster: &Cluster,
        sku: &str,
        role: MachineRole,
    ) -> Result<serde_json::Value> {
        if lock(&self.state).fail_machine_specs {
            return Err(CloudError::Validation(format!("unknown sku {sku}")));
        }
        Ok(serde_json::json!({ "sku": sku, "role": role.to_string() }))
    }

    fn master_sku(&self, total_nodes: u32) -> String {
        if total_nodes > 10 {
            "4core-8gb".to_string()
        } else {
            "2core-4gb".to_string()
        }
    }

    async fn create_credentials(&self, cluster: &Cluster, client: &dyn KubeClient) -> Result<()> {
        self.record(format!("create_credentials {}", cluster.name()));
        client
            .create_secret(
                KUBE_SYSTEM,
                &SecretData {
                    name: "fake-cloud-config".to_string(),
                    secret_type: "Opaque".to_string(),
                    data: BTreeMap::from([("zone".to_string(), cluster.config.cloud.zone.clone())]),
                },
            )
            .await
    }

    async fn admin_client(&self, cluster: &Cluster) -> Result<Arc<dyn KubeClient>> {
        match &self.admin {
            Some(cache) => cache.get(cluster).await,
            None => Ok(Arc::new(self.kube.clone())),
        }
    }

    async fn apply_delete(&self, cluster: &mut Cluster) -> Result<()> {
        self.record(format!("apply_delete {}", cluster.name()));
        for master in self.kube.nodes().into_iter().filter(Node::is_master) {
            lock(&self.state).deleted.push(master.provider_id.clone());
            self.kube.delete_node(&master.name).await?;
        }
        cluster.status.api_endpoints.clear();
        Ok(())
    }

    fn cluster_api_components(&self, _cluster: &Cluster) -> Result<String> {
        Ok("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: fake-provider-system\n".to_string())
    }

    fn instance_manager(&self) -> Arc<dyn InstanceManager> {
        Arc::new(self.clone())
    }

    fn ssh_config(&self, _cluster: &Cluster, node: &Node) -> Result<SshConfig> {
        Ok(SshConfig::new(node.name.clone(), "fake-private-key"))
    }
}

#[async_trait]
impl InstanceManager for FakeCloud {
    async fn create_instance(
        &self,
        cluster: &Cluster,
        name: &str,
        token: &str,
        node_group: &NodeGroup,
    ) -> Result<NodeInfo> {
        if lock(&self.state).fail_creation {
            return Err(CloudError::CommandFailed(format!("quota exceeded creating {name}")));
        }
        if token.is_empty() {
            return Err(CloudError::Validation("missing join token".into()));
        }

        let version = if node_group.spec.template.kubelet_version.is_empty() {
            cluster.config.kubernetes_version.clone()
        } else {
            node_group.spec.template.kubelet_version.clone()
        };
        let address = self.next_address();
        let provider_id = format!("fake://{name}");
        self.kube.add_node(Node {
            name: name.to_string(),
            provider_id: provider_id.clone(),
            kubelet_version: version,
            labels: BTreeMap::from([
                (ROLE_NODE_LABEL.to_string(), String::new()),
                (NODE_GROUP_LABEL.to_string(), node_group.name().to_string()),
            ]),
            addresses: vec![NodeAddress::new(AddressType::ExternalIp, address.clone())],
        });

        let mut state = lock(&self.state);
        state.created.push(name.to_string());
        state.events.push(format!("create_instance {name}"));
        Ok(NodeInfo {
            name: name.to_string(),
            provider_id,
            public_ip: Some(address),
            private_ip: None,
        })
    }

    async fn delete_instance_by_provider_id(&self, provider_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.deleted.push(provider_id.to_string());
        state.events.push(format!("delete_instance {provider_id}"));
        Ok(())
    }

    async fn prepare_node_group(&self, node_group: &NodeGroup) -> Result<()> {
        self.record(format!("prepare_node_group {}", node_group.name()));
        Ok(())
    }

    async fn cleanup_node_group(&self, node_group: &NodeGroup) -> Result<()> {
        let mut state = lock(&self.state);
        state.cleaned.push(node_group.name().to_string());
        state.events.push(format!("cleanup_node_group {}", node_group.name()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExecState {
    commands: Vec<(String, String)>,
    failing_hosts: BTreeSet<String>,
}

/// Records commands and plays their effect on a [`FakeKube`]
///
/// `kubeadm upgrade apply <v>` moves the server and that node to `<v>`; a
/// kubelet restart moves the node to the server's version.
#[derive(Debug, Clone)]
pub struct RecordingExecutor {
    kube: FakeKube,
    state: Arc<Mutex<ExecState>>,
}

impl RecordingExecutor {
    pub fn new(kube: FakeKube) -> Self {
        Self {
            kube,
            state: Arc::new(Mutex::new(ExecState::default())),
        }
    }

    /// `(host, command)` pairs in execution order
    pub fn commands(&self) -> Vec<(String, String)> {
        lock(&self.state).commands.clone()
    }

    pub fn fail_on(&self, host: &str) {
        lock(&self.state).failing_hosts.insert(host.to_string());
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn execute(&self, ssh: &SshConfig, command: &str) -> Result<String> {
        {
            let mut state = lock(&self.state);
            if state.failing_hosts.contains(&ssh.host) {
                return Err(CloudError::CommandFailed(format!(
                    "{}@{}: connection refused",
                    ssh.user, ssh.host
                )));
            }
            state.commands.push((ssh.host.clone(), command.to_string()));
        }

        if let Some(rest) = command.split("kubeadm upgrade apply ").nth(1) {
            let version = rest.split_whitespace().next().unwrap_or_default();
            self.kube.set_server_version(version);
            self.kube.set_kubelet_version(&ssh.host, version);
        } else if command.contains("systemctl restart kubelet") {
            let version = self.kube.server_version().await?;
            self.kube.set_kubelet_version(&ssh.host, &version);
        }
        Ok(String::new())
    }
}
