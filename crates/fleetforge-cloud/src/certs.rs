//! Cluster trust material
//!
//! Four self-signed CA pairs and one SSH keypair per cluster, created once and
//! loaded afterwards. Nothing here regenerates implicitly: replacing a pair
//! means deleting it from the store first.

use crate::error::{CloudError, Result, ResultExt};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fleetforge_core::{CertificateRecord, ObjectMeta, SshKeyRecord, Store};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData,
};
use time::{Duration, OffsetDateTime};

pub const CA_CERT_NAME: &str = "ca";
pub const FRONT_PROXY_CA_CERT_NAME: &str = "front-proxy-ca";
pub const SA_CERT_NAME: &str = "sa";
pub const ETCD_CA_CERT_NAME: &str = "etcd-ca";

const CA_VALIDITY_DAYS: i64 = 3650;
const CLIENT_VALIDITY_DAYS: i64 = 365;

const ADMIN_COMMON_NAME: &str = "kubernetes-admin";
const ADMIN_ORGANIZATION: &str = "system:masters";

const SSH_KEY_TYPE: &str = "ecdsa-sha2-nistp256";
const SSH_CURVE: &str = "nistp256";

/// PEM certificate and private key
#[derive(Debug, Clone, PartialEq)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SshKeyPair {
    /// `authorized_keys` line
    pub public_key: String,
    /// PKCS#8 PEM, readable by OpenSSH
    pub private_key_pem: String,
}

/// All trust material of one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct Certificates {
    pub ca: CertKeyPair,
    pub front_proxy_ca: CertKeyPair,
    pub service_account: CertKeyPair,
    pub etcd_ca: CertKeyPair,
    pub ssh_key: SshKeyPair,
}

pub fn ssh_key_name(cluster: &str) -> String {
    format!("{cluster}-sshkey")
}

fn cert_err(what: &str) -> impl Fn(rcgen::Error) -> CloudError + '_ {
    move |e| CloudError::Certificate(format!("{what}: {e}"))
}

fn validity(days: i64) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    (now - Duration::minutes(5), now + Duration::days(days))
}

/// Self-signed CA with `common_name`
pub fn generate_ca(common_name: &str) -> Result<CertKeyPair> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    (params.not_before, params.not_after) = validity(CA_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(cert_err("failed to generate CA key"))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(cert_err("failed to self-sign CA"))?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Client certificate for `kubernetes-admin` in `system:masters`, signed by `ca`.
pub fn create_admin_certificate(ca: &CertKeyPair) -> Result<CertKeyPair> {
    let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(cert_err("failed to load CA key"))?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
        .map_err(cert_err("failed to load CA certificate"))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(ADMIN_COMMON_NAME.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ADMIN_ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    (params.not_before, params.not_after) = validity(CLIENT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(cert_err("failed to generate admin key"))?;
    let cert = params
        .signed_by(&key_pair, &issuer)
        .map_err(cert_err("failed to sign admin certificate"))?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn ssh_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// ECDSA P-256 keypair in OpenSSH formats
pub fn generate_ssh_keypair(comment: &str) -> Result<SshKeyPair> {
    let key_pair = KeyPair::generate().map_err(cert_err("failed to generate SSH key"))?;

    // SubjectPublicKeyInfo for P-256 ends with the 65-byte uncompressed point
    let spki = key_pair.subject_public_key_info();
    let point = spki
        .get(spki.len().saturating_sub(65)..)
        .filter(|p| p.len() == 65 && p[0] == 0x04)
        .ok_or_else(|| CloudError::Certificate("unexpected SSH public key encoding".into()))?;

    let mut blob = Vec::new();
    ssh_string(&mut blob, SSH_KEY_TYPE.as_bytes());
    ssh_string(&mut blob, SSH_CURVE.as_bytes());
    ssh_string(&mut blob, point);

    Ok(SshKeyPair {
        public_key: format!("{SSH_KEY_TYPE} {} {comment}", STANDARD.encode(&blob)),
        private_key_pem: key_pair.serialize_pem(),
    })
}

async fn ensure_ca(store: &Store, cluster: &str, name: &str, common_name: &str) -> Result<CertKeyPair> {
    if let Some(existing) = store.find::<CertificateRecord>(cluster, name).await? {
        return Ok(CertKeyPair {
            cert_pem: existing.cert_pem,
            key_pem: existing.key_pem,
        });
    }

    let pair = generate_ca(common_name)?;
    store
        .create(&CertificateRecord {
            metadata: ObjectMeta::owned_by(name, cluster),
            cert_pem: pair.cert_pem.clone(),
            key_pem: pair.key_pem.clone(),
        })
        .await
        .with_context(|| format!("failed to store {name} certificate"))?;
    tracing::info!(cluster, name, "generated certificate authority");
    Ok(pair)
}

async fn ensure_ssh_key(store: &Store, cluster: &str) -> Result<SshKeyPair> {
    let name = ssh_key_name(cluster);
    if let Some(existing) = store.find::<SshKeyRecord>(cluster, &name).await? {
        return Ok(SshKeyPair {
            public_key: existing.public_key,
            private_key_pem: existing.private_key_pem,
        });
    }

    let pair = generate_ssh_keypair(&name)?;
    store
        .create(&SshKeyRecord {
            metadata: ObjectMeta::owned_by(name.clone(), cluster),
            public_key: pair.public_key.clone(),
            private_key_pem: pair.private_key_pem.clone(),
        })
        .await
        .context("failed to store SSH key")?;
    tracing::info!(cluster, name = %name, "generated SSH key");
    Ok(pair)
}

/// Creates whatever trust material `cluster` is missing and returns all of it.
pub async fn create_certs_keys(store: &Store, cluster: &str) -> Result<Certificates> {
    Ok(Certificates {
        ca: ensure_ca(store, cluster, CA_CERT_NAME, "kubernetes").await?,
        front_proxy_ca: ensure_ca(store, cluster, FRONT_PROXY_CA_CERT_NAME, "front-proxy-ca")
            .await?,
        service_account: ensure_ca(store, cluster, SA_CERT_NAME, "service-account").await?,
        etcd_ca: ensure_ca(store, cluster, ETCD_CA_CERT_NAME, "etcd-ca").await?,
        ssh_key: ensure_ssh_key(store, cluster).await?,
    })
}

async fn load_pair(store: &Store, cluster: &str, name: &str) -> Result<CertKeyPair> {
    let record: CertificateRecord = store
        .get(cluster, name)
        .await
        .with_context(|| format!("failed to load {name} certs"))?;
    Ok(CertKeyPair {
        cert_pem: record.cert_pem,
        key_pem: record.key_pem,
    })
}

/// Loads existing trust material; never generates.
pub async fn get_certs(store: &Store, cluster: &str) -> Result<Certificates> {
    let ssh: SshKeyRecord = store
        .get(cluster, &ssh_key_name(cluster))
        .await
        .context("failed to load ssh keys")?;
    Ok(Certificates {
        ca: load_pair(store, cluster, CA_CERT_NAME).await?,
        front_proxy_ca: load_pair(store, cluster, FRONT_PROXY_CA_CERT_NAME).await?,
        service_account: load_pair(store, cluster, SA_CERT_NAME).await?,
        etcd_ca: load_pair(store, cluster, ETCD_CA_CERT_NAME).await?,
        ssh_key: SshKeyPair {
            public_key: ssh.public_key,
            private_key_pem: ssh.private_key_pem,
        },
    })
}

/// Removes all trust material of `cluster`; missing records are skipped.
pub async fn delete_certs(store: &Store, cluster: &str) -> Result<()> {
    for name in [
        CA_CERT_NAME,
        FRONT_PROXY_CA_CERT_NAME,
        SA_CERT_NAME,
        ETCD_CA_CERT_NAME,
    ] {
        match store.delete::<CertificateRecord>(cluster, name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    match store
        .delete::<SshKeyRecord>(cluster, &ssh_key_name(cluster))
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ca_is_pem() {
        let ca = generate_ca("kubernetes").unwrap();
        assert!(ca.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_admin_certificate_signed_by_ca() {
        let ca = generate_ca("kubernetes").unwrap();
        let admin = create_admin_certificate(&ca).unwrap();
        assert!(admin.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_ne!(admin.cert_pem, ca.cert_pem);
        assert_ne!(admin.key_pem, ca.key_pem);
    }

    #[test]
    fn test_ssh_public_key_format() {
        let pair = generate_ssh_keypair("demo-sshkey").unwrap();
        let mut parts = pair.public_key.split(' ');
        assert_eq!(parts.next(), Some("ecdsa-sha2-nistp256"));
        let blob = STANDARD.decode(parts.next().unwrap()).unwrap();
        // 4+19 type, 4+8 curve, 4+65 point
        assert_eq!(blob.len(), 104);
        assert_eq!(parts.next(), Some("demo-sshkey"));
    }

    #[tokio::test]
    async fn test_create_certs_keys_is_create_once() {
        let store = Store::in_memory();
        let first = create_certs_keys(&store, "demo").await.unwrap();
        let second = create_certs_keys(&store, "demo").await.unwrap();
        assert_eq!(first, second);

        let loaded = get_certs(&store, "demo").await.unwrap();
        assert_eq!(loaded, first);
        assert_ne!(loaded.ca, loaded.etcd_ca);
    }

    #[tokio::test]
    async fn test_get_certs_missing_is_wrapped() {
        let store = Store::in_memory();
        let err = get_certs(&store, "demo").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("failed to load ssh keys"));
    }

    #[tokio::test]
    async fn test_delete_then_recreate_regenerates() {
        let store = Store::in_memory();
        let first = create_certs_keys(&store, "demo").await.unwrap();
        delete_certs(&store, "demo").await.unwrap();
        let second = create_certs_keys(&store, "demo").await.unwrap();
        assert_ne!(first.ca, second.ca);
    }
}
