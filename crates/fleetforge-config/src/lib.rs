pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイルを直接指定する環境変数
pub const CONFIG_ENV: &str = "FLEETFORGE_CONFIG";

const LOCAL_CONFIG_FILE: &str = "fleetforge.yaml";
const LOCAL_CONFIG_DIR: &str = ".fleetforge";
const GLOBAL_CONFIG_FILE: &str = "config.yaml";
const DEFAULT_STORE_DIR: &str = "store";

/// FleetForgeの設定ディレクトリを取得 (~/.config/fleetforge)
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("fleetforge");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 FLEETFORGE_CONFIG (存在しなくても採用し、保存先になる)
/// 2. カレントディレクトリ: fleetforge.yaml
/// 3. ./.fleetforge/fleetforge.yaml
/// 4. ~/.config/fleetforge/config.yaml (グローバル設定)
///
/// どれも無ければ `None` (既定値で動作する)
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        if !config_path.is_empty() {
            return Ok(Some(PathBuf::from(config_path)));
        }
    }

    let current_dir = std::env::current_dir()?;
    let candidates = [
        current_dir.join(LOCAL_CONFIG_FILE),
        current_dir.join(LOCAL_CONFIG_DIR).join(LOCAL_CONFIG_FILE),
    ];
    if let Some(path) = candidates.into_iter().find(|p| p.is_file()) {
        return Ok(Some(path));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("fleetforge").join(GLOBAL_CONFIG_FILE);
        if global_config.is_file() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

/// クラスター状態の保存先
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreSettings {
    /// ディレクトリ配下に YAML で保存 (省略時 ~/.config/fleetforge/store)
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    /// プロセス終了で消える (テスト・お試し用)
    Memory,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::File { path: None }
    }
}

/// 待機のポーリング設定 (秒)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "{what}.interval_secs は 1 以上にしてください"
            )));
        }
        if self.timeout_secs < self.interval_secs {
            return Err(ConfigError::Invalid(format!(
                "{what}.timeout_secs は interval_secs 以上にしてください"
            )));
        }
        Ok(())
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 15 * 60,
        }
    }
}

/// ブートストラップトークンの設定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub ttl_hours: u64,
    pub retries: u32,
    pub retry_interval_secs: u64,
}

impl TokenSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 60 * 60)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            retries: 5,
            retry_interval_secs: 15,
        }
    }
}

/// fleetforge.yaml の内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub store: StoreSettings,

    /// `forge use cluster` で選んだ既定のクラスター
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cluster: Option<String>,

    /// マスター起動待ち
    pub master_poll: PollSettings,

    /// アップグレード後のバージョン収束待ち
    pub upgrade_poll: PollSettings,

    pub token: TokenSettings,

    /// 読み込み元 (保存先)
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl ForgeConfig {
    /// 設定ファイルを探して読み込む。無ければ既定値。
    pub fn load() -> Result<Self> {
        match find_config_file()? {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// `path` から読み込む。ファイルが無ければ既定値 (保存先は `path`)。
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
        } else {
            Self::default()
        };
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        config.path = Some(path);
        Ok(config)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn validate(&self) -> Result<()> {
        self.master_poll.validate("master_poll")?;
        self.upgrade_poll.validate("upgrade_poll")?;
        if self.token.ttl_hours == 0 {
            return Err(ConfigError::Invalid(
                "token.ttl_hours は 1 以上にしてください".into(),
            ));
        }
        if self.token.retries == 0 {
            return Err(ConfigError::Invalid(
                "token.retries は 1 以上にしてください".into(),
            ));
        }
        Ok(())
    }

    /// 読み込み元に保存する。読み込み元が無ければグローバル設定に保存。
    pub fn save(&mut self) -> Result<PathBuf> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => get_config_dir()?.join(GLOBAL_CONFIG_FILE),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        tracing::debug!(path = %path.display(), "saved config");
        self.path = Some(path.clone());
        Ok(path)
    }

    pub fn use_cluster(&mut self, name: impl Into<String>) {
        self.current_cluster = Some(name.into());
    }

    /// 引数のクラスター名、無ければ既定のクラスター
    pub fn resolve_cluster(&self, name: Option<&str>) -> Result<String> {
        name.map(str::to_string)
            .or_else(|| self.current_cluster.clone())
            .ok_or(ConfigError::NoCurrentCluster)
    }

    /// ファイルストアのディレクトリ。メモリストアなら `None`。
    ///
    /// 相対パスは設定ファイルのディレクトリを基準にする。
    pub fn store_dir(&self) -> Result<Option<PathBuf>> {
        match &self.store {
            StoreSettings::Memory => Ok(None),
            StoreSettings::File { path: Some(path) } if path.is_relative() => {
                let base = self
                    .path
                    .as_deref()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                Ok(Some(base.join(path)))
            }
            StoreSettings::File { path: Some(path) } => Ok(Some(path.clone())),
            StoreSettings::File { path: None } => Ok(Some(get_config_dir()?.join(DEFAULT_STORE_DIR))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("fleetforge"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join("fleetforge.yaml"), "current_cluster: demo\n").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_ENV, find_config_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert!(result.unwrap().unwrap().ends_with("fleetforge.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_dot_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        let dot_dir = temp_dir.path().join(".fleetforge");
        fs::create_dir(&dot_dir).unwrap();
        fs::write(dot_dir.join("fleetforge.yaml"), "").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = temp_env::with_var_unset(CONFIG_ENV, find_config_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert!(
            result
                .unwrap()
                .unwrap()
                .ends_with(".fleetforge/fleetforge.yaml")
        );
    }

    #[test]
    #[serial]
    fn test_env_var_wins_even_if_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join("fleetforge.yaml"), "").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();
        let custom = temp_dir.path().join("custom.yaml");

        let result = temp_env::with_var(CONFIG_ENV, Some(&custom), find_config_file);

        std::env::set_current_dir(original_dir).unwrap();
        assert_eq!(result.unwrap(), Some(custom));
    }

    #[test]
    fn test_defaults() {
        let config = ForgeConfig::default();
        assert_eq!(config.store, StoreSettings::File { path: None });
        assert_eq!(config.token.ttl(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.master_poll.interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("fleetforge.yaml");
        fs::write(
            &path,
            "store:\n  kind: file\n  path: state\nupgrade_poll:\n  timeout_secs: 3600\n",
        )
        .unwrap();

        let config = ForgeConfig::load_from(&path).unwrap();
        assert_eq!(config.upgrade_poll.timeout_secs, 3600);
        assert_eq!(config.upgrade_poll.interval_secs, 5);
        assert_eq!(config.token.retries, 5);
        assert_eq!(
            config.store_dir().unwrap(),
            Some(temp_dir.path().join("state"))
        );
    }

    #[test]
    fn test_memory_store() {
        let config: ForgeConfig = serde_yaml::from_str("store:\n  kind: memory\n").unwrap();
        assert_eq!(config.store_dir().unwrap(), None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("fleetforge.yaml");
        fs::write(&path, "master_poll:\n  interval_secs: 0\n").unwrap();
        assert!(matches!(
            ForgeConfig::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, "store: [").unwrap();
        assert!(matches!(
            ForgeConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_use_cluster_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("fleetforge.yaml");

        let mut config = ForgeConfig::load_from(&path).unwrap();
        assert!(matches!(
            config.resolve_cluster(None),
            Err(ConfigError::NoCurrentCluster)
        ));

        config.use_cluster("demo");
        assert_eq!(config.save().unwrap(), path);

        let reloaded = ForgeConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.resolve_cluster(None).unwrap(), "demo");
        assert_eq!(reloaded.resolve_cluster(Some("other")).unwrap(), "other");
    }
}
