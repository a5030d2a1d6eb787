//! Trust material and cloud credentials

use super::meta::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A PEM certificate and its private key, stored per cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub metadata: ObjectMeta,
    pub cert_pem: String,
    pub key_pem: String,
}

/// The cluster's SSH keypair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshKeyRecord {
    pub metadata: ObjectMeta,
    /// OpenSSH `authorized_keys` line
    pub public_key: String,
    pub private_key_pem: String,
}

/// Provider credentials (API tokens and the like)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub metadata: ObjectMeta,
    pub provider: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Credential {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            provider: provider.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}
