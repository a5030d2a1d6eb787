//! kubeadm bootstrap tokens
//!
//! A token is `<id>.<secret>`; it lives in a `bootstrap-token-<id>` secret in
//! kube-system with the two halves in separate keys.

use crate::error::{Result, ResultExt};
use crate::kube::{KUBE_SYSTEM, KubeClient, SecretData};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const BOOTSTRAP_TOKEN_SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";
pub const BOOTSTRAP_TOKEN_SECRET_PREFIX: &str = "bootstrap-token-";
pub const NODE_BOOTSTRAP_GROUP: &str = "system:bootstrappers:kubeadm:default-node-token";

const TOKEN_ID_KEY: &str = "token-id";
const TOKEN_SECRET_KEY: &str = "token-secret";
const EXPIRATION_KEY: &str = "expiration";

const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Tokens expiring sooner than this are not handed out to new machines
const REUSE_MARGIN_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    pub ttl: Duration,
    /// Secret listing attempts before falling back to creation
    pub retries: u32,
    pub retry_interval: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            retries: 5,
            retry_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    pub id: String,
    pub secret: String,
}

pub(crate) fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

impl BootstrapToken {
    pub fn generate() -> Self {
        Self {
            id: random_string(TOKEN_ID_LEN),
            secret: random_string(TOKEN_SECRET_LEN),
        }
    }

    pub fn secret_name(&self) -> String {
        format!("{BOOTSTRAP_TOKEN_SECRET_PREFIX}{}", self.id)
    }

    /// The secret payload for this token, valid until `now + ttl`.
    pub fn to_secret(&self, ttl: Duration, now: DateTime<Utc>) -> SecretData {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let expiration = now + ttl;
        let hours = ttl.num_hours();

        let data = BTreeMap::from([
            (TOKEN_ID_KEY.to_string(), self.id.clone()),
            (TOKEN_SECRET_KEY.to_string(), self.secret.clone()),
            (EXPIRATION_KEY.to_string(), expiration.to_rfc3339()),
            ("usage-bootstrap-authentication".to_string(), "true".to_string()),
            ("usage-bootstrap-signing".to_string(), "true".to_string()),
            ("auth-extra-groups".to_string(), NODE_BOOTSTRAP_GROUP.to_string()),
            (
                "description".to_string(),
                format!("Bootstrap token generated for {hours} hours"),
            ),
        ]);

        SecretData {
            name: self.secret_name(),
            secret_type: BOOTSTRAP_TOKEN_SECRET_TYPE.to_string(),
            data,
        }
    }

    fn from_secret(secret: &SecretData) -> Option<(Self, DateTime<Utc>)> {
        let id = secret.data.get(TOKEN_ID_KEY)?;
        let token_secret = secret.data.get(TOKEN_SECRET_KEY)?;
        let expiration = DateTime::parse_from_rfc3339(secret.data.get(EXPIRATION_KEY)?)
            .ok()?
            .with_timezone(&Utc);
        Some((
            Self {
                id: id.clone(),
                secret: token_secret.clone(),
            },
            expiration,
        ))
    }
}

impl fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.secret)
    }
}

/// First token in `secrets` still valid for more than the reuse margin at `now`.
pub fn find_reusable_token(secrets: &[SecretData], now: DateTime<Utc>) -> Option<BootstrapToken> {
    let cutoff = now + chrono::Duration::minutes(REUSE_MARGIN_MINUTES);
    secrets
        .iter()
        .filter(|s| s.secret_type == BOOTSTRAP_TOKEN_SECRET_TYPE)
        .filter_map(BootstrapToken::from_secret)
        .find(|(_, expiration)| *expiration > cutoff)
        .map(|(token, _)| token)
}

/// Returns a join token with at least an hour of validity left, creating one if needed.
///
/// Listing failures are retried `config.retries` times; a successful scan
/// without a usable token goes straight to creation.
pub async fn get_existing_kubeadm_token(
    client: &dyn KubeClient,
    config: &TokenConfig,
) -> Result<String> {
    for attempt in 1..=config.retries {
        match client
            .list_secrets(KUBE_SYSTEM, BOOTSTRAP_TOKEN_SECRET_TYPE)
            .await
        {
            Ok(secrets) => {
                if let Some(token) = find_reusable_token(&secrets, Utc::now()) {
                    tracing::debug!(id = %token.id, "reusing bootstrap token");
                    return Ok(token.to_string());
                }
                break;
            }
            Err(e) => {
                tracing::warn!(attempt, "failed to list bootstrap tokens: {e}");
                if attempt < config.retries {
                    tokio::time::sleep(config.retry_interval).await;
                }
            }
        }
    }

    create_valid_kubeadm_token(client, config.ttl).await
}

/// Creates a fresh bootstrap token valid for `ttl`.
pub async fn create_valid_kubeadm_token(client: &dyn KubeClient, ttl: Duration) -> Result<String> {
    let token = BootstrapToken::generate();
    client
        .create_secret(KUBE_SYSTEM, &token.to_secret(ttl, Utc::now()))
        .await
        .context("failed to create bootstrap token")?;
    tracing::info!(id = %token.id, "created bootstrap token");
    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKube;

    fn secret_expiring_in(minutes: i64) -> SecretData {
        let now = Utc::now();
        let token = BootstrapToken::generate();
        let mut secret = token.to_secret(Duration::from_secs(3600), now);
        secret.data.insert(
            EXPIRATION_KEY.to_string(),
            (now + chrono::Duration::minutes(minutes)).to_rfc3339(),
        );
        secret
    }

    #[test]
    fn test_token_format() {
        let token = BootstrapToken::generate();
        let text = token.to_string();
        let (id, secret) = text.split_once('.').unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert!(
            text.chars()
                .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert_eq!(token.secret_name(), format!("bootstrap-token-{id}"));
    }

    #[test]
    fn test_secret_payload() {
        let token = BootstrapToken {
            id: "abcdef".to_string(),
            secret: "0123456789abcdef".to_string(),
        };
        let secret = token.to_secret(Duration::from_secs(24 * 3600), Utc::now());
        assert_eq!(secret.secret_type, BOOTSTRAP_TOKEN_SECRET_TYPE);
        assert_eq!(secret.data["token-id"], "abcdef");
        assert_eq!(secret.data["token-secret"], "0123456789abcdef");
        assert_eq!(secret.data["auth-extra-groups"], NODE_BOOTSTRAP_GROUP);
        assert_eq!(
            secret.data["description"],
            "Bootstrap token generated for 24 hours"
        );
    }

    #[test]
    fn test_reuse_window() {
        let now = Utc::now();
        let fresh = secret_expiring_in(90);
        assert!(find_reusable_token(std::slice::from_ref(&fresh), now).is_some());

        let stale = secret_expiring_in(30);
        assert!(find_reusable_token(&[stale], now).is_none());
    }

    #[tokio::test]
    async fn test_reuses_valid_token() {
        let kube = FakeKube::new("v1.13.5");
        let existing = secret_expiring_in(90);
        let expected_id = existing.data["token-id"].clone();
        kube.insert_secret(existing);

        let token = get_existing_kubeadm_token(&kube, &TokenConfig::default())
            .await
            .unwrap();

        assert!(token.starts_with(&format!("{expected_id}.")));
        assert_eq!(kube.secrets().len(), 1);
    }

    #[tokio::test]
    async fn test_creates_token_when_only_expiring_ones_exist() {
        let kube = FakeKube::new("v1.13.5");
        kube.insert_secret(secret_expiring_in(30));

        let token = get_existing_kubeadm_token(&kube, &TokenConfig::default())
            .await
            .unwrap();

        let secrets = kube.secrets();
        assert_eq!(secrets.len(), 2);
        let (id, _) = token.split_once('.').unwrap();
        assert!(secrets.iter().any(|s| s.name == format!("bootstrap-token-{id}")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_failures_fall_back_to_creation() {
        let kube = FakeKube::new("v1.13.5");
        kube.fail_secret_listing(10);

        let token = get_existing_kubeadm_token(&kube, &TokenConfig::default())
            .await
            .unwrap();

        assert_eq!(token.len(), 23);
        assert_eq!(kube.secrets().len(), 1);
    }
}
