//! Sakura Cloud provider implementation

use crate::error::{Result as SakuraResult, SakuraError};
use crate::startup_scripts;
use crate::usacloud::{CreateServerConfig, NoteInfo, ServerApi, ServerInfo, Usacloud};
use async_trait::async_trait;
use fleetforge_cloud::kube::{KUBE_SYSTEM, SecretData};
use fleetforge_cloud::{
    AdminClientCache, CloudError, CloudManager, InstanceManager, KubeClient, NodeInfo,
    ProviderContext, Result, SshConfig,
};
use fleetforge_core::{AddressType, Cluster, Machine, MachineRole, Node, NodeAddress, NodeGroup};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const PROVIDER_NAME: &str = "sakura";

pub const DEFAULT_ZONE: &str = "is1a";
pub const DEFAULT_OS: &str = "ubuntu2204";
pub const DEFAULT_NETWORK: &str = "flannel";
const DEFAULT_DISK_SIZE_GB: u32 = 40;

/// Credential keys
pub const ACCESS_TOKEN_KEY: &str = "access-token";
pub const ACCESS_TOKEN_SECRET_KEY: &str = "access-token-secret";

const CREDENTIAL_SECRET_NAME: &str = "sakura-cloud-credential";
const PROVIDER_NAMESPACE: &str = "sakura-provider-system";
const PROVIDER_ID_SCHEME: &str = "sakura://";

const TAG: &str = "fleetforge";

fn cluster_tag(cluster: &str) -> String {
    format!("fleetforge-cluster={cluster}")
}

fn note_name(cluster: &str, suffix: &str) -> String {
    format!("fleetforge-{cluster}-{suffix}")
}

/// Parse plan string like "2core-4gb" to (core, memory_gb)
pub fn parse_plan(plan: &str) -> SakuraResult<(u32, u32)> {
    let invalid = || SakuraError::InvalidPlan(plan.to_string());
    let (core, memory) = plan.split_once('-').ok_or_else(invalid)?;
    let core = core
        .strip_suffix("core")
        .and_then(|c| c.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let memory = memory
        .strip_suffix("gb")
        .and_then(|m| m.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    if core == 0 || memory == 0 {
        return Err(invalid());
    }
    Ok((core, memory))
}

/// `sakura://is1a/demo-pool-x` -> (`is1a`, `demo-pool-x`)
pub fn parse_provider_id(provider_id: &str) -> SakuraResult<(&str, &str)> {
    provider_id
        .strip_prefix(PROVIDER_ID_SCHEME)
        .and_then(|rest| rest.split_once('/'))
        .filter(|(zone, name)| !zone.is_empty() && !name.is_empty())
        .ok_or_else(|| SakuraError::InvalidProviderId(provider_id.to_string()))
}

pub fn provider_id(zone: &str, name: &str) -> String {
    format!("{PROVIDER_ID_SCHEME}{zone}/{name}")
}

/// Machine provider spec stored on machines and node group templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SakuraMachineSpec {
    pub sku: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub os: String,
    #[serde(default = "default_disk_size")]
    pub disk_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MachineRole>,
}

fn default_disk_size() -> u32 {
    DEFAULT_DISK_SIZE_GB
}

impl SakuraMachineSpec {
    fn from_value(value: &serde_json::Value, cluster: &Cluster) -> SakuraResult<Self> {
        let mut spec: Self = serde_json::from_value(value.clone())?;
        if spec.zone.is_empty() {
            spec.zone = cluster.config.cloud.zone.clone();
        }
        if spec.os.is_empty() {
            spec.os = DEFAULT_OS.to_string();
        }
        Ok(spec)
    }

    fn server_config(
        &self,
        name: &str,
        ssh_key_id: &str,
        note_id: String,
        tags: Vec<String>,
    ) -> SakuraResult<CreateServerConfig> {
        let (core, memory) = parse_plan(&self.sku)?;
        Ok(CreateServerConfig {
            name: name.to_string(),
            core,
            memory,
            disk_size: self.disk_size,
            os_type: self.os.clone(),
            host_name: Some(name.to_string()),
            ssh_key_ids: vec![ssh_key_id.to_string()],
            note_ids: vec![note_id],
            tags,
        })
    }
}

fn ssh_key_id(cluster: &Cluster) -> Result<&str> {
    cluster
        .status
        .cloud
        .ssh_key_external_id
        .as_deref()
        .ok_or_else(|| {
            CloudError::Validation(format!(
                "ssh key of cluster `{}` has not been imported",
                cluster.name()
            ))
        })
}

struct Shared {
    api: Arc<dyn ServerApi>,
    ctx: ProviderContext,
    admin: AdminClientCache,
}

impl Shared {
    async fn find_server(&self, zone: &str, name: &str) -> SakuraResult<Option<ServerInfo>> {
        Ok(self
            .api
            .list_servers(zone)
            .await?
            .into_iter()
            .find(|s| s.name == name))
    }

    /// Creates the note or replaces its content.
    async fn upsert_note(&self, name: &str, content: &str) -> SakuraResult<NoteInfo> {
        let existing = self
            .api
            .list_notes()
            .await?
            .into_iter()
            .find(|n| n.name == name);
        match existing {
            Some(note) => {
                self.api.update_note(&note.id_str(), content).await?;
                Ok(note)
            }
            None => self.api.create_note(name, content).await,
        }
    }
}

/// Sakura Cloud cluster manager
pub struct SakuraClusterManager {
    shared: Arc<Shared>,
}

/// Worker instances on Sakura Cloud
pub struct SakuraInstanceManager {
    shared: Arc<Shared>,
}

impl SakuraClusterManager {
    pub fn new(ctx: ProviderContext, api: Arc<dyn ServerApi>) -> Self {
        let admin = ctx.admin_client_cache();
        Self {
            shared: Arc::new(Shared { api, ctx, admin }),
        }
    }

    /// Registry factory backed by the usacloud CLI.
    ///
    /// Without a credential usacloud falls back to its own profile.
    pub fn factory() -> impl Fn(ProviderContext) -> Result<Arc<dyn CloudManager>> + Send + Sync + 'static
    {
        |ctx: ProviderContext| -> Result<Arc<dyn CloudManager>> {
            let usacloud = match &ctx.credential {
                Some(credential) => {
                    let token = credential
                        .get(ACCESS_TOKEN_KEY)
                        .ok_or(SakuraError::MissingCredential(ACCESS_TOKEN_KEY))?;
                    let secret = credential
                        .get(ACCESS_TOKEN_SECRET_KEY)
                        .ok_or(SakuraError::MissingCredential(ACCESS_TOKEN_SECRET_KEY))?;
                    Usacloud::with_token(token, secret)
                }
                None => Usacloud::new(),
            };
            Ok(Arc::new(Self::new(ctx, Arc::new(usacloud))) as Arc<dyn CloudManager>)
        }
    }
}

#[async_trait]
impl CloudManager for SakuraClusterManager {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn apply_defaults(&self, cluster: &mut Cluster) -> Result<()> {
        let config = &mut cluster.config;
        if config.cloud.zone.is_empty() {
            config.cloud.zone = DEFAULT_ZONE.to_string();
        }
        if config.cloud.region.is_empty() {
            config.cloud.region = config.cloud.zone.clone();
        }
        if config.cloud.os.is_empty() {
            config.cloud.os = DEFAULT_OS.to_string();
        }
        if config.network_provider.is_empty() {
            config.network_provider = DEFAULT_NETWORK.to_string();
        }
        Ok(())
    }

    async fn prepare_cloud(&self, cluster: &mut Cluster) -> Result<()> {
        let certs = self.shared.ctx.certs()?;
        let name = cluster.config.cloud.ssh_key_name.clone();

        let existing = self
            .shared
            .api
            .list_ssh_keys()
            .await?
            .into_iter()
            .find(|k| k.name == name);
        let key = match existing {
            Some(key) => key,
            None => {
                tracing::info!(cluster = %cluster.name(), key = %name, "importing ssh key");
                self.shared
                    .api
                    .create_ssh_key(&name, &certs.ssh_key.public_key)
                    .await?
            }
        };
        cluster.status.cloud.ssh_key_external_id = Some(key.id_str());
        Ok(())
    }

    async fn ensure_master(&self, cluster: &mut Cluster, machine: &Machine) -> Result<()> {
        let spec = SakuraMachineSpec::from_value(&machine.spec.provider_spec, cluster)?;

        let server = match self.shared.find_server(&spec.zone, machine.name()).await? {
            Some(server) => {
                tracing::debug!(server = %server.name, "master instance already exists");
                server
            }
            None => {
                let certs = self.shared.ctx.certs()?;
                let script = startup_scripts::master_script(cluster, certs);
                let note = self
                    .shared
                    .upsert_note(&note_name(cluster.name(), "master"), &script)
                    .await?;
                let config = spec.server_config(
                    machine.name(),
                    ssh_key_id(cluster)?,
                    note.id_str(),
                    vec![
                        TAG.to_string(),
                        cluster_tag(cluster.name()),
                        "fleetforge-role=master".to_string(),
                    ],
                )?;
                tracing::info!(server = %config.name, zone = %spec.zone, "creating master instance");
                self.shared.api.create_server(&spec.zone, &config).await?
            }
        };

        let ip = server.ip_address().ok_or_else(|| {
            CloudError::CommandFailed(format!("server {} has no IP address", server.name))
        })?;
        cluster.set_api_endpoints(&[NodeAddress::new(AddressType::ExternalIp, ip)]);
        Ok(())
    }

    fn default_machine_provider_spec(
        &self,
        cluster: &Cluster,
        sku: &str,
        role: MachineRole,
    ) -> Result<serde_json::Value> {
        parse_plan(sku)?;
        let os = if cluster.config.cloud.os.is_empty() {
            DEFAULT_OS.to_string()
        } else {
            cluster.config.cloud.os.clone()
        };
        let spec = SakuraMachineSpec {
            sku: sku.to_string(),
            zone: cluster.config.cloud.zone.clone(),
            os,
            disk_size: DEFAULT_DISK_SIZE_GB,
            role: Some(role),
        };
        Ok(serde_json::to_value(spec)?)
    }

    fn master_sku(&self, total_nodes: u32) -> String {
        match total_nodes {
            n if n > 250 => "16core-32gb",
            n if n > 100 => "8core-16gb",
            n if n > 10 => "4core-8gb",
            _ => "2core-4gb",
        }
        .to_string()
    }

    async fn create_credentials(&self, cluster: &Cluster, client: &dyn KubeClient) -> Result<()> {
        let Some(credential) = &self.shared.ctx.credential else {
            tracing::warn!(
                cluster = %cluster.name(),
                "no cloud credential configured, skipping {CREDENTIAL_SECRET_NAME} secret"
            );
            return Ok(());
        };

        let mut data = BTreeMap::new();
        for key in [ACCESS_TOKEN_KEY, ACCESS_TOKEN_SECRET_KEY] {
            let value = credential.get(key).ok_or(SakuraError::MissingCredential(key))?;
            data.insert(key.to_string(), value.to_string());
        }
        data.insert("zone".to_string(), cluster.config.cloud.zone.clone());

        client
            .create_secret(
                KUBE_SYSTEM,
                &SecretData {
                    name: CREDENTIAL_SECRET_NAME.to_string(),
                    secret_type: "Opaque".to_string(),
                    data,
                },
            )
            .await
    }

    async fn admin_client(&self, cluster: &Cluster) -> Result<Arc<dyn KubeClient>> {
        self.shared.admin.get(cluster).await
    }

    async fn apply_delete(&self, cluster: &mut Cluster) -> Result<()> {
        let zone = cluster.config.cloud.zone.clone();
        let tag = cluster_tag(cluster.name());

        for server in self.shared.api.list_servers(&zone).await? {
            if !server.has_tag(&tag) {
                continue;
            }
            tracing::info!(server = %server.name, "deleting instance");
            if let Err(e) = self.shared.api.delete_server(&zone, &server.id_str(), true).await {
                tracing::warn!(server = %server.name, "failed to delete instance: {e}");
            }
        }

        if let Some(id) = cluster.status.cloud.ssh_key_external_id.take() {
            if let Err(e) = self.shared.api.delete_ssh_key(&id).await {
                tracing::warn!(key = %id, "failed to delete ssh key: {e}");
            }
        }

        let prefix = note_name(cluster.name(), "");
        for note in self.shared.api.list_notes().await? {
            if note.name.starts_with(&prefix) {
                self.shared.api.delete_note(&note.id_str()).await?;
            }
        }

        cluster.status.api_endpoints.clear();
        Ok(())
    }

    fn cluster_api_components(&self, cluster: &Cluster) -> Result<String> {
        let docs = [
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": PROVIDER_NAMESPACE },
            }),
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {
                    "name": "sakura-provider-config",
                    "namespace": PROVIDER_NAMESPACE,
                },
                "data": {
                    "cluster": cluster.name(),
                    "zone": cluster.config.cloud.zone,
                    "credentialSecret": CREDENTIAL_SECRET_NAME,
                },
            }),
        ];
        let rendered = docs
            .iter()
            .map(serde_yaml::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rendered.join("---\n"))
    }

    fn instance_manager(&self) -> Arc<dyn InstanceManager> {
        Arc::new(SakuraInstanceManager {
            shared: self.shared.clone(),
        })
    }

    fn ssh_config(&self, _cluster: &Cluster, node: &Node) -> Result<SshConfig> {
        let certs = self.shared.ctx.certs()?;
        let host = node.reachable_address().ok_or_else(|| {
            CloudError::Validation(format!("node {} has no reachable address", node.name))
        })?;
        Ok(SshConfig::new(host, certs.ssh_key.private_key_pem.clone()))
    }
}

#[async_trait]
impl InstanceManager for SakuraInstanceManager {
    async fn create_instance(
        &self,
        cluster: &Cluster,
        name: &str,
        token: &str,
        node_group: &NodeGroup,
    ) -> Result<NodeInfo> {
        let endpoint = cluster.status.api_endpoints.first().ok_or_else(|| {
            CloudError::Validation(format!("cluster `{}` has no API endpoint yet", cluster.name()))
        })?;
        let endpoint = format!("{}:{}", endpoint.host, endpoint.port);

        let spec = SakuraMachineSpec::from_value(&node_group.spec.template.provider_spec, cluster)?;

        // One note per group; every instance derives its provider id from its hostname.
        let script = startup_scripts::node_script(
            cluster,
            &endpoint,
            token,
            &provider_id(&spec.zone, "$(hostname)"),
        );
        let note = self
            .shared
            .upsert_note(&note_name(cluster.name(), node_group.name()), &script)
            .await?;

        let config = spec.server_config(
            name,
            ssh_key_id(cluster)?,
            note.id_str(),
            vec![
                TAG.to_string(),
                cluster_tag(cluster.name()),
                "fleetforge-role=node".to_string(),
                format!("fleetforge-nodegroup={}", node_group.name()),
            ],
        )?;
        tracing::info!(server = %name, zone = %spec.zone, "creating instance");
        let server = self.shared.api.create_server(&spec.zone, &config).await?;

        Ok(NodeInfo {
            name: server.name.clone(),
            provider_id: provider_id(&spec.zone, name),
            public_ip: server.ip_address(),
            private_ip: None,
        })
    }

    async fn delete_instance_by_provider_id(&self, provider_id: &str) -> Result<()> {
        let (zone, name) = parse_provider_id(provider_id)?;
        match self.shared.find_server(zone, name).await? {
            Some(server) => {
                tracing::info!(server = %name, "deleting instance");
                self.shared
                    .api
                    .delete_server(zone, &server.id_str(), true)
                    .await?;
            }
            None => tracing::debug!(server = %name, "instance already gone"),
        }
        Ok(())
    }

    async fn cleanup_node_group(&self, node_group: &NodeGroup) -> Result<()> {
        let name = note_name(&node_group.metadata.cluster_name, node_group.name());
        for note in self.shared.api.list_notes().await? {
            if note.name == name {
                self.shared.api.delete_note(&note.id_str()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usacloud::{InterfaceInfo, SshKeyInfo};
    use fleetforge_cloud::certs;
    use fleetforge_cloud::testing::FakeKube;
    use fleetforge_core::{ClusterConfig, Credential, Store};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApiState {
        servers: Vec<(String, ServerInfo)>,
        keys: Vec<SshKeyInfo>,
        notes: Vec<(NoteInfo, String)>,
        created: Vec<CreateServerConfig>,
        next_id: u64,
    }

    #[derive(Default, Clone)]
    struct FakeApi {
        state: Arc<Mutex<FakeApiState>>,
    }

    impl FakeApi {
        fn state(&self) -> std::sync::MutexGuard<'_, FakeApiState> {
            self.state.lock().unwrap()
        }
    }

    fn next_id(state: &mut FakeApiState) -> serde_json::Value {
        state.next_id += 1;
        serde_json::json!(113500000000u64 + state.next_id)
    }

    #[async_trait]
    impl ServerApi for FakeApi {
        async fn list_servers(&self, zone: &str) -> SakuraResult<Vec<ServerInfo>> {
            Ok(self
                .state()
                .servers
                .iter()
                .filter(|(z, _)| z == zone)
                .map(|(_, s)| s.clone())
                .collect())
        }

        async fn create_server(
            &self,
            zone: &str,
            config: &CreateServerConfig,
        ) -> SakuraResult<ServerInfo> {
            let mut state = self.state();
            let id = next_id(&mut state);
            let server = ServerInfo {
                id,
                name: config.name.clone(),
                cpu: Some(config.core as i32),
                memory_mb: Some((config.memory * 1024) as i32),
                instance_status: Some("up".to_string()),
                interfaces: Some(vec![InterfaceInfo {
                    ip_address: Some(format!("203.0.113.{}", state.next_id)),
                }]),
                tags: config.tags.clone(),
            };
            state.servers.push((zone.to_string(), server.clone()));
            state.created.push(config.clone());
            Ok(server)
        }

        async fn delete_server(&self, _zone: &str, id: &str, _with_disks: bool) -> SakuraResult<()> {
            self.state().servers.retain(|(_, s)| s.id_str() != id);
            Ok(())
        }

        async fn list_ssh_keys(&self) -> SakuraResult<Vec<SshKeyInfo>> {
            Ok(self.state().keys.clone())
        }

        async fn create_ssh_key(&self, name: &str, public_key: &str) -> SakuraResult<SshKeyInfo> {
            let mut state = self.state();
            let key = SshKeyInfo {
                id: next_id(&mut state),
                name: name.to_string(),
                public_key: Some(public_key.to_string()),
            };
            state.keys.push(key.clone());
            Ok(key)
        }

        async fn delete_ssh_key(&self, id: &str) -> SakuraResult<()> {
            self.state().keys.retain(|k| k.id_str() != id);
            Ok(())
        }

        async fn list_notes(&self) -> SakuraResult<Vec<NoteInfo>> {
            Ok(self.state().notes.iter().map(|(n, _)| n.clone()).collect())
        }

        async fn create_note(&self, name: &str, content: &str) -> SakuraResult<NoteInfo> {
            let mut state = self.state();
            let note = NoteInfo {
                id: next_id(&mut state),
                name: name.to_string(),
            };
            state.notes.push((note.clone(), content.to_string()));
            Ok(note)
        }

        async fn update_note(&self, id: &str, content: &str) -> SakuraResult<()> {
            let mut state = self.state();
            let note = state
                .notes
                .iter_mut()
                .find(|(n, _)| n.id_str() == id)
                .ok_or_else(|| SakuraError::CommandFailed(format!("note {id} not found")))?;
            note.1 = content.to_string();
            Ok(())
        }

        async fn delete_note(&self, id: &str) -> SakuraResult<()> {
            self.state().notes.retain(|(n, _)| n.id_str() != id);
            Ok(())
        }
    }

    struct Env {
        api: FakeApi,
        kube: FakeKube,
        manager: SakuraClusterManager,
        cluster: Cluster,
    }

    async fn env() -> Env {
        let store = Store::in_memory();
        let kube = FakeKube::new("v1.29.3");
        let api = FakeApi::default();
        let certs = certs::create_certs_keys(&store, "demo").await.unwrap();
        let ctx = ProviderContext::new(store, Arc::new(kube.clone()))
            .with_certs(Arc::new(certs))
            .with_credential(
                Credential::new("sakura", PROVIDER_NAME)
                    .with(ACCESS_TOKEN_KEY, "token")
                    .with(ACCESS_TOKEN_SECRET_KEY, "secret"),
            );
        let manager = SakuraClusterManager::new(ctx, Arc::new(api.clone()));

        let mut cluster = Cluster::new(
            "demo",
            ClusterConfig {
                kubernetes_version: "v1.29.3".to_string(),
                master_count: 1,
                ..Default::default()
            },
        );
        cluster.config.cloud.ssh_key_name = certs::ssh_key_name("demo");
        manager.apply_defaults(&mut cluster).unwrap();

        Env {
            api,
            kube,
            manager,
            cluster,
        }
    }

    fn master(env: &Env) -> Machine {
        let mut machine = Machine::master("demo", 0, "v1.29.3");
        machine.spec.provider_spec = env
            .manager
            .default_machine_provider_spec(&env.cluster, "2core-4gb", MachineRole::Master)
            .unwrap();
        machine
    }

    #[test]
    fn test_parse_plan() {
        assert_eq!(parse_plan("2core-4gb").unwrap(), (2, 4));
        assert_eq!(parse_plan("16core-32gb").unwrap(), (16, 32));
        assert!(matches!(parse_plan("large"), Err(SakuraError::InvalidPlan(_))));
        assert!(parse_plan("0core-4gb").is_err());
        assert!(parse_plan("2core-4tb").is_err());
    }

    #[test]
    fn test_provider_id() {
        let id = provider_id("is1a", "demo-pool-abc");
        assert_eq!(id, "sakura://is1a/demo-pool-abc");
        assert_eq!(parse_provider_id(&id).unwrap(), ("is1a", "demo-pool-abc"));
        assert!(parse_provider_id("fake://x").is_err());
        assert!(parse_provider_id("sakura://is1a/").is_err());
    }

    #[tokio::test]
    async fn test_defaults_and_master_sku() {
        let env = env().await;
        assert_eq!(env.cluster.config.cloud.zone, DEFAULT_ZONE);
        assert_eq!(env.cluster.config.network_provider, DEFAULT_NETWORK);

        assert_eq!(env.manager.master_sku(3), "2core-4gb");
        assert_eq!(env.manager.master_sku(11), "4core-8gb");
        assert_eq!(env.manager.master_sku(101), "8core-16gb");
        assert_eq!(env.manager.master_sku(251), "16core-32gb");

        let err = env
            .manager
            .default_machine_provider_spec(&env.cluster, "huge", MachineRole::Node)
            .unwrap_err();
        assert!(matches!(err, CloudError::Validation(_)));
    }

    #[tokio::test]
    async fn test_prepare_cloud_imports_key_once() {
        let mut env = env().await;
        env.manager.prepare_cloud(&mut env.cluster).await.unwrap();
        let first = env.cluster.status.cloud.ssh_key_external_id.clone();
        env.manager.prepare_cloud(&mut env.cluster).await.unwrap();

        assert!(first.is_some());
        assert_eq!(env.cluster.status.cloud.ssh_key_external_id, first);
        let keys = env.api.state().keys.clone();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "demo-sshkey");
    }

    #[tokio::test]
    async fn test_ensure_master_is_idempotent() {
        let mut env = env().await;
        env.manager.prepare_cloud(&mut env.cluster).await.unwrap();
        let machine = master(&env);

        env.manager.ensure_master(&mut env.cluster, &machine).await.unwrap();
        let url = env.cluster.api_server_url();
        env.manager.ensure_master(&mut env.cluster, &machine).await.unwrap();

        assert!(url.is_some());
        assert_eq!(env.cluster.api_server_url(), url);
        let state = env.api.state();
        assert_eq!(state.created.len(), 1);
        assert_eq!(state.created[0].core, 2);
        assert!(state.created[0].tags.contains(&"fleetforge-cluster=demo".to_string()));
        assert_eq!(state.notes.len(), 1);
        assert!(state.notes[0].1.contains("kubeadm init"));
    }

    #[tokio::test]
    async fn test_instances_round_trip_through_provider_id() {
        let mut env = env().await;
        env.manager.prepare_cloud(&mut env.cluster).await.unwrap();
        let machine = master(&env);
        env.manager
            .ensure_master(&mut env.cluster, &machine)
            .await
            .unwrap();

        let mut group = NodeGroup::new("demo", "pool-a", "2core-4gb", 2);
        group.spec.template.provider_spec = env
            .manager
            .default_machine_provider_spec(&env.cluster, "2core-4gb", MachineRole::Node)
            .unwrap();

        let instances = env.manager.instance_manager();
        let a = instances
            .create_instance(&env.cluster, "pool-a-1", "abcdef.0123456789abcdef", &group)
            .await
            .unwrap();
        instances
            .create_instance(&env.cluster, "pool-a-2", "abcdef.0123456789abcdef", &group)
            .await
            .unwrap();
        assert_eq!(a.provider_id, "sakura://is1a/pool-a-1");
        assert!(a.public_ip.is_some());
        // master note plus one shared by the group
        assert_eq!(env.api.state().notes.len(), 2);

        instances.delete_instance_by_provider_id(&a.provider_id).await.unwrap();
        instances.delete_instance_by_provider_id(&a.provider_id).await.unwrap();
        assert_eq!(env.api.state().servers.len(), 2);

        instances.cleanup_node_group(&group).await.unwrap();
        assert_eq!(env.api.state().notes.len(), 1);
    }

    #[tokio::test]
    async fn test_create_instance_requires_endpoint() {
        let env = env().await;
        let group = NodeGroup::new("demo", "pool-a", "2core-4gb", 1);
        let err = env
            .manager
            .instance_manager()
            .create_instance(&env.cluster, "pool-a-1", "t", &group)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no API endpoint"));
    }

    #[tokio::test]
    async fn test_create_credentials() {
        let env = env().await;
        env.manager
            .create_credentials(&env.cluster, &env.kube)
            .await
            .unwrap();
        let secrets = env.kube.secrets();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name, CREDENTIAL_SECRET_NAME);
        assert_eq!(secrets[0].data[ACCESS_TOKEN_KEY], "token");
        assert_eq!(secrets[0].data["zone"], "is1a");
    }

    #[tokio::test]
    async fn test_apply_delete_removes_cluster_resources() {
        let mut env = env().await;
        env.manager.prepare_cloud(&mut env.cluster).await.unwrap();
        let machine = master(&env);
        env.manager
            .ensure_master(&mut env.cluster, &machine)
            .await
            .unwrap();
        let other = CreateServerConfig {
            name: "unrelated".to_string(),
            core: 1,
            memory: 1,
            disk_size: 20,
            os_type: DEFAULT_OS.to_string(),
            host_name: None,
            ssh_key_ids: vec![],
            note_ids: vec![],
            tags: vec![],
        };
        env.api.create_server("is1a", &other).await.unwrap();

        env.manager.apply_delete(&mut env.cluster).await.unwrap();

        let state = env.api.state();
        assert_eq!(state.servers.len(), 1);
        assert_eq!(state.servers[0].1.name, "unrelated");
        assert!(state.keys.is_empty());
        assert!(state.notes.is_empty());
        assert!(env.cluster.status.cloud.ssh_key_external_id.is_none());
        assert!(env.cluster.api_server_url().is_none());
    }

    #[tokio::test]
    async fn test_components_manifest() {
        let env = env().await;
        let manifest = env.manager.cluster_api_components(&env.cluster).unwrap();
        assert!(manifest.contains("kind: Namespace"));
        assert!(manifest.contains("name: sakura-provider-system"));
        assert!(manifest.contains("zone: is1a"));
        assert_eq!(manifest.matches("---\n").count(), 1);
    }

    #[test]
    fn test_factory_requires_both_keys() {
        let kube = FakeKube::new("v1.29.3");
        let ctx = ProviderContext::new(Store::in_memory(), Arc::new(kube)).with_credential(
            Credential::new("sakura", PROVIDER_NAME).with(ACCESS_TOKEN_KEY, "token"),
        );
        let factory = SakuraClusterManager::factory();
        let err = factory(ctx).err().unwrap();
        assert!(err.to_string().contains(ACCESS_TOKEN_SECRET_KEY));
    }
}
