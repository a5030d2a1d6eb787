//! Wiring shared by every command: config, store, providers and connectors

use anyhow::Context as _;
use fleetforge_cloud::{
    CloudRegistry, ClusterApplier, ClusterLifecycle, EngineSettings, KubeConnector,
    KubeRsConnector, PollConfig, SshExecutor, TokenConfig,
};
use fleetforge_cloud_sakura::{PROVIDER_NAME as SAKURA, SakuraClusterManager};
use fleetforge_config::ForgeConfig;
use fleetforge_core::{FileStore, StateLock, Store};
use std::sync::Arc;

pub struct Context {
    pub config: ForgeConfig,
    pub store: Store,
    file_store: Option<Arc<FileStore>>,
    registry: CloudRegistry,
    kube: Arc<dyn KubeConnector>,
}

impl Context {
    pub fn load() -> anyhow::Result<Self> {
        let config = ForgeConfig::load().context("設定の読み込みに失敗しました")?;

        let file_store = config
            .store_dir()
            .context("ストアの場所を決定できません")?
            .map(|dir| Arc::new(FileStore::new(dir)));
        let store = match &file_store {
            Some(file_store) => Store::new(file_store.clone()),
            None => {
                tracing::warn!("memory store selected, nothing will be persisted");
                Store::in_memory()
            }
        };

        let registry = CloudRegistry::new().with(SAKURA, SakuraClusterManager::factory());

        Ok(Self {
            config,
            store,
            file_store,
            registry,
            kube: Arc::new(KubeRsConnector),
        })
    }

    pub fn lifecycle(&self) -> ClusterLifecycle {
        ClusterLifecycle::new(self.store.clone(), self.registry.clone(), self.kube.clone())
    }

    pub fn applier(&self) -> ClusterApplier {
        ClusterApplier::new(
            self.store.clone(),
            self.registry.clone(),
            self.kube.clone(),
            Arc::new(SshExecutor),
        )
        .with_settings(self.engine_settings())
    }

    fn engine_settings(&self) -> EngineSettings {
        let c = &self.config;
        EngineSettings {
            poll: PollConfig::new(c.master_poll.interval(), c.master_poll.timeout()),
            upgrade_poll: PollConfig::new(c.upgrade_poll.interval(), c.upgrade_poll.timeout()),
            token: TokenConfig {
                ttl: c.token.ttl(),
                retries: c.token.retries,
                retry_interval: c.token.retry_interval(),
            },
        }
    }

    /// 引数のクラスター名、無ければ既定のクラスター
    pub fn cluster_name(&self, name: Option<String>) -> anyhow::Result<String> {
        Ok(self.config.resolve_cluster(name.as_deref())?)
    }

    /// apply 中にクラスターを排他する。メモリストアではロック不要。
    pub async fn lock(&self, cluster: &str) -> anyhow::Result<Option<StateLock>> {
        match &self.file_store {
            Some(file_store) => Ok(Some(file_store.acquire_lock(cluster).await?)),
            None => Ok(None),
        }
    }
}
