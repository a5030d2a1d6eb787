//! Remote command execution over SSH

use crate::error::{CloudError, Result};
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;

/// How to reach one machine
#[derive(Debug, Clone, PartialEq)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub private_key_pem: String,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            user: "root".to_string(),
            host: host.into(),
            port: 22,
            private_key_pem: private_key_pem.into(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

/// Runs shell commands on machines
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` and returns its stdout; a non-zero exit is an error.
    async fn execute(&self, ssh: &SshConfig, command: &str) -> Result<String>;
}

/// Shells out to the OpenSSH client
#[derive(Debug, Clone, Default)]
pub struct SshExecutor;

impl SshExecutor {
    fn write_key(pem: &str) -> Result<tempfile::NamedTempFile> {
        let mut key = tempfile::NamedTempFile::new()?;
        key.write_all(pem.as_bytes())?;
        key.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key.path(), std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(key)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, ssh: &SshConfig, command: &str) -> Result<String> {
        let key = Self::write_key(&ssh.private_key_pem)?;

        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(key.path())
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "BatchMode=yes"])
            .arg("-p")
            .arg(ssh.port.to_string())
            .arg(format!("{}@{}", ssh.user, ssh.host))
            .arg(command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running on {}@{}: {}", ssh.user, ssh.host, command);

        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloudError::CommandFailed(format!(
                "{}@{}: {}",
                ssh.user,
                ssh.host,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
