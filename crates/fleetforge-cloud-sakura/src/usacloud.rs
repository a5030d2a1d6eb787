//! usacloud CLI wrapper
//!
//! Wraps the usacloud CLI commands for Sakura Cloud operations.

use crate::error::{Result, SakuraError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Sakura Cloud operations the provider needs
///
/// Servers are zonal; SSH keys and notes (startup scripts) are global.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn list_servers(&self, zone: &str) -> Result<Vec<ServerInfo>>;

    async fn create_server(&self, zone: &str, config: &CreateServerConfig) -> Result<ServerInfo>;

    async fn delete_server(&self, zone: &str, id: &str, with_disks: bool) -> Result<()>;

    async fn list_ssh_keys(&self) -> Result<Vec<SshKeyInfo>>;

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyInfo>;

    async fn delete_ssh_key(&self, id: &str) -> Result<()>;

    async fn list_notes(&self) -> Result<Vec<NoteInfo>>;

    async fn create_note(&self, name: &str, content: &str) -> Result<NoteInfo>;

    async fn update_note(&self, id: &str, content: &str) -> Result<()>;

    async fn delete_note(&self, id: &str) -> Result<()>;
}

/// usacloud CLI wrapper
#[derive(Default)]
pub struct Usacloud {
    access_token: Option<String>,
    access_token_secret: Option<String>,
}

impl Usacloud {
    /// Uses the usacloud profile for authentication.
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticates with an explicit API key instead of the usacloud profile.
    pub fn with_token(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            access_token_secret: Some(secret.into()),
        }
    }

    /// Check if usacloud is installed
    pub async fn check_installed(&self) -> Result<()> {
        let which = Command::new("which").arg("usacloud").output().await?;
        if !which.status.success() {
            return Err(SakuraError::UsacloudNotFound);
        }
        Ok(())
    }

    /// Run a usacloud command and return stdout
    async fn run_command(&self, zone: Option<&str>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("usacloud");
        if let Some(zone) = zone {
            cmd.arg("--zone").arg(zone);
        }
        cmd.args(args);
        if let (Some(token), Some(secret)) = (&self.access_token, &self.access_token_secret) {
            cmd.env("SAKURACLOUD_ACCESS_TOKEN", token);
            cmd.env("SAKURACLOUD_ACCESS_TOKEN_SECRET", secret);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!(
            "Running: usacloud {}{}",
            zone.map(|z| format!("--zone {z} ")).unwrap_or_default(),
            args.join(" ")
        );

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SakuraError::UsacloudNotFound);
            }
            Err(e) => return Err(e.into()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SakuraError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_list<T: serde::de::DeserializeOwned>(output: &str) -> Result<Vec<T>> {
        if output.trim().is_empty() || output.trim() == "[]" {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(output)?)
    }

    /// `usacloud ... create -o json` prints a one-element array.
    fn parse_created<T: serde::de::DeserializeOwned>(output: &str, what: &str) -> Result<T> {
        let value: serde_json::Value = serde_json::from_str(output)?;
        let value = match value {
            serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            serde_json::Value::Array(_) => {
                return Err(SakuraError::CommandFailed(format!(
                    "usacloud returned no {what}"
                )));
            }
            other => other,
        };
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ServerApi for Usacloud {
    async fn list_servers(&self, zone: &str) -> Result<Vec<ServerInfo>> {
        let output = self
            .run_command(Some(zone), &["server", "list", "--output-type", "json"])
            .await?;
        Self::parse_list(&output)
    }

    async fn create_server(&self, zone: &str, config: &CreateServerConfig) -> Result<ServerInfo> {
        // Store string conversions to extend their lifetime
        let core_str = config.core.to_string();
        let memory_str = config.memory.to_string();
        let disk_size_str = config.disk_size.to_string();
        let tags = config.tags.join(",");

        let mut args = vec![
            "server",
            "create",
            "--name",
            config.name.as_str(),
            "--core",
            core_str.as_str(),
            "--memory",
            memory_str.as_str(),
            "--disk-size",
            disk_size_str.as_str(),
            "--os-type",
            config.os_type.as_str(),
            "--output-type",
            "json",
            "--yes",
        ];

        if let Some(host_name) = &config.host_name {
            args.push("--disk-edit-host-name");
            args.push(host_name.as_str());
        }

        for id in &config.ssh_key_ids {
            args.push("--disk-edit-ssh-key-id");
            args.push(id.as_str());
        }

        for id in &config.note_ids {
            args.push("--disk-edit-note-id");
            args.push(id.as_str());
        }

        if !tags.is_empty() {
            args.push("--tags");
            args.push(tags.as_str());
        }

        let output = self.run_command(Some(zone), &args).await?;
        Self::parse_created(&output, "server")
    }

    async fn delete_server(&self, zone: &str, id: &str, with_disks: bool) -> Result<()> {
        let mut args = vec!["server", "delete", id, "--force", "--yes"];

        if with_disks {
            args.push("--with-disks");
        }

        self.run_command(Some(zone), &args).await?;
        Ok(())
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKeyInfo>> {
        let output = self
            .run_command(None, &["ssh-key", "list", "--output-type", "json"])
            .await?;
        Self::parse_list(&output)
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyInfo> {
        let output = self
            .run_command(
                None,
                &[
                    "ssh-key",
                    "create",
                    "--name",
                    name,
                    "--public-key",
                    public_key,
                    "--output-type",
                    "json",
                    "--yes",
                ],
            )
            .await?;
        Self::parse_created(&output, "ssh key")
    }

    async fn delete_ssh_key(&self, id: &str) -> Result<()> {
        self.run_command(None, &["ssh-key", "delete", id, "--yes"])
            .await?;
        Ok(())
    }

    async fn list_notes(&self) -> Result<Vec<NoteInfo>> {
        let output = self
            .run_command(None, &["note", "list", "--output-type", "json"])
            .await?;
        Self::parse_list(&output)
    }

    async fn create_note(&self, name: &str, content: &str) -> Result<NoteInfo> {
        let output = self
            .run_command(
                None,
                &[
                    "note",
                    "create",
                    "--name",
                    name,
                    "--class",
                    "shell",
                    "--content",
                    content,
                    "--output-type",
                    "json",
                    "--yes",
                ],
            )
            .await?;
        Self::parse_created(&output, "note")
    }

    async fn update_note(&self, id: &str, content: &str) -> Result<()> {
        self.run_command(None, &["note", "update", id, "--content", content, "--yes"])
            .await?;
        Ok(())
    }

    async fn delete_note(&self, id: &str) -> Result<()> {
        self.run_command(None, &["note", "delete", id, "--yes"])
            .await?;
        Ok(())
    }
}

/// Sakura resource IDs come back as JSON numbers or strings depending on the command.
fn id_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Server information from usacloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "ID")]
    pub id: serde_json::Value,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "CPU")]
    pub cpu: Option<i32>,

    #[serde(rename = "MemoryMB")]
    pub memory_mb: Option<i32>,

    #[serde(rename = "InstanceStatus")]
    pub instance_status: Option<String>,

    #[serde(rename = "Interfaces")]
    pub interfaces: Option<Vec<InterfaceInfo>>,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

impl ServerInfo {
    pub fn id_str(&self) -> String {
        id_string(&self.id)
    }

    /// Get the first IP address
    pub fn ip_address(&self) -> Option<String> {
        self.interfaces
            .as_ref()?
            .iter()
            .find_map(|i| i.ip_address.clone())
    }

    /// Check if server is running
    pub fn is_running(&self) -> bool {
        self.instance_status.as_deref() == Some("up")
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(rename = "IPAddress")]
    pub ip_address: Option<String>,
}

/// Configuration for creating a server
#[derive(Debug, Clone, PartialEq)]
pub struct CreateServerConfig {
    pub name: String,
    pub core: u32,
    pub memory: u32,
    pub disk_size: u32,
    pub os_type: String,
    pub host_name: Option<String>,
    pub ssh_key_ids: Vec<String>,
    pub note_ids: Vec<String>,
    pub tags: Vec<String>,
}

/// SSH key information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyInfo {
    #[serde(rename = "ID")]
    pub id: serde_json::Value,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "PublicKey")]
    pub public_key: Option<String>,
}

impl SshKeyInfo {
    pub fn id_str(&self) -> String {
        id_string(&self.id)
    }
}

/// Startup script (note) information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteInfo {
    #[serde(rename = "ID")]
    pub id: serde_json::Value,

    #[serde(rename = "Name")]
    pub name: String,
}

impl NoteInfo {
    pub fn id_str(&self) -> String {
        id_string(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_ip() {
        let json = r#"[{
            "ID": 113500000001,
            "Name": "demo-master-0",
            "CPU": 2,
            "MemoryMB": 4096,
            "InstanceStatus": "up",
            "Interfaces": [{"IPAddress": "192.168.1.1"}],
            "Tags": ["fleetforge", "fleetforge-cluster=demo"]
        }]"#;
        let servers: Vec<ServerInfo> = Usacloud::parse_list(json).unwrap();

        assert_eq!(servers[0].id_str(), "113500000001");
        assert_eq!(servers[0].ip_address(), Some("192.168.1.1".to_string()));
        assert!(servers[0].is_running());
        assert!(servers[0].has_tag("fleetforge-cluster=demo"));
    }

    #[test]
    fn test_parse_created_unwraps_array() {
        let key: SshKeyInfo =
            Usacloud::parse_created(r#"[{"ID": "1135", "Name": "demo-sshkey"}]"#, "ssh key").unwrap();
        assert_eq!(key.id_str(), "1135");

        let err = Usacloud::parse_created::<SshKeyInfo>("[]", "ssh key").unwrap_err();
        assert!(matches!(err, SakuraError::CommandFailed(_)));
    }

    #[test]
    fn test_empty_list() {
        assert!(Usacloud::parse_list::<NoteInfo>("  \n").unwrap().is_empty());
    }
}
