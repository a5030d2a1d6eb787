//! [`KubeClient`] backed by kube-rs

use crate::error::{CloudError, Result};
use crate::kube::{ComponentHealth, KubeClient, KubeConnector, KubeEndpoint, SecretData};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fleetforge_core::{AddressType, Node, NodeAddress};
use k8s_openapi::api::core::v1::{ComponentStatus, Namespace, Node as KubeNode, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, DeleteParams, DynamicObject, EvictParams, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::Discovery;
use kube::{Client, Config};
use serde::Deserialize;
use std::sync::Arc;

const FIELD_MANAGER: &str = "fleetforge";
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

fn kube_err(e: kube::Error) -> CloudError {
    CloudError::Kube(e.to_string())
}

/// Connects with admin client certificates
#[derive(Debug, Clone, Default)]
pub struct KubeRsConnector;

#[async_trait]
impl KubeConnector for KubeRsConnector {
    async fn connect(&self, endpoint: &KubeEndpoint) -> Result<Arc<dyn KubeClient>> {
        let kubeconfig = admin_kubeconfig(endpoint)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| CloudError::Kube(format!("invalid admin kubeconfig: {e}")))?;
        let client = Client::try_from(config).map_err(kube_err)?;
        tracing::debug!(server = %endpoint.server, "connected admin client");
        Ok(Arc::new(KubeRsClient::new(client)))
    }
}

/// Splits a multi-document YAML bundle, dropping empty documents.
///
/// The YAML deserializer is not `Send`, so every document is read before any
/// request is made.
fn parse_manifests(manifests: &str) -> Result<Vec<serde_json::Value>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifests) {
        let obj = serde_json::Value::deserialize(document)?;
        if !obj.is_null() {
            objects.push(obj);
        }
    }
    Ok(objects)
}

/// Kubeconfig with embedded CA and client certificate for `endpoint`
pub fn admin_kubeconfig(endpoint: &KubeEndpoint) -> Result<Kubeconfig> {
    let context = endpoint.user_name.clone();
    let value = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": endpoint.cluster_name,
            "cluster": {
                "server": endpoint.server,
                "certificate-authority-data": STANDARD.encode(&endpoint.ca_pem),
            },
        }],
        "users": [{
            "name": endpoint.user_name,
            "user": {
                "client-certificate-data": STANDARD.encode(&endpoint.client_cert_pem),
                "client-key-data": STANDARD.encode(&endpoint.client_key_pem),
            },
        }],
        "contexts": [{
            "name": context,
            "context": {
                "cluster": endpoint.cluster_name,
                "user": endpoint.user_name,
            },
        }],
        "current-context": context,
    });
    Ok(serde_json::from_value(value)?)
}

pub struct KubeRsClient {
    client: Client,
}

impl KubeRsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply_one(&self, discovery: &Discovery, obj: serde_json::Value) -> Result<()> {
        let field = |pointer: &str| {
            obj.pointer(pointer)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let missing = |what: &str| CloudError::Validation(format!("manifest is missing {what}"));
        let kind = field("/kind").ok_or_else(|| missing("kind"))?;
        let api_version = field("/apiVersion").ok_or_else(|| missing("apiVersion"))?;
        let name = field("/metadata/name").ok_or_else(|| missing("metadata.name"))?;
        let namespace = field("/metadata/namespace");

        let (group, version) = api_version
            .split_once('/')
            .unwrap_or(("", api_version.as_str()));
        let gvk = GroupVersionKind::gvk(group, version, &kind);
        let (resource, _) = discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| {
                CloudError::Kube(format!("unknown resource type {api_version}/{kind}"))
            })?;

        let api: Api<DynamicObject> = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .map_err(|e| CloudError::Kube(format!("failed to apply {kind}/{name}: {e}")))?;

        tracing::debug!(kind = %kind, name = %name, namespace = ?namespace, "applied manifest");
        Ok(())
    }
}

fn to_node(node: KubeNode) -> Node {
    let status = node.status.unwrap_or_default();
    let addresses = status
        .addresses
        .unwrap_or_default()
        .into_iter()
        .filter_map(|a| {
            let kind = match a.type_.as_str() {
                "ExternalIP" => AddressType::ExternalIp,
                "InternalIP" => AddressType::InternalIp,
                "Hostname" => AddressType::Hostname,
                _ => return None,
            };
            Some(NodeAddress::new(kind, a.address))
        })
        .collect();

    Node {
        name: node.metadata.name.unwrap_or_default(),
        provider_id: node
            .spec
            .and_then(|s| s.provider_id)
            .unwrap_or_default(),
        kubelet_version: status
            .node_info
            .map(|i| i.kubelet_version)
            .unwrap_or_default(),
        labels: node.metadata.labels.unwrap_or_default(),
        addresses,
    }
}

fn evictable(pod: &Pod) -> bool {
    let daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Succeeded" || p == "Failed");
    !(daemonset || mirror || finished)
}

#[async_trait]
impl KubeClient for KubeRsClient {
    async fn probe(&self) -> Result<()> {
        self.client.apiserver_version().await.map_err(kube_err)?;
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await.map_err(kube_err)?;
        Ok(info.git_version)
    }

    async fn component_statuses(&self) -> Result<Vec<ComponentHealth>> {
        let api: Api<ComponentStatus> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(kube_err)?;
        Ok(list
            .items
            .into_iter()
            .map(|cs| ComponentHealth {
                name: cs.metadata.name.unwrap_or_default(),
                healthy: cs
                    .conditions
                    .unwrap_or_default()
                    .iter()
                    .any(|c| c.type_ == "Healthy" && c.status == "True"),
            })
            .collect())
    }

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(kube_err)?;
        Ok(list.items.into_iter().map(to_node).collect())
    }

    async fn cordon_node(&self, name: &str) -> Result<()> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "unschedulable": true } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(kube_err)?;
        Ok(())
    }

    async fn evict_pods(&self, node: &str) -> Result<()> {
        let all: Api<Pod> = Api::all(self.client.clone());
        let pods = all
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await
            .map_err(kube_err)?;

        for pod in pods.items.iter().filter(|p| evictable(p)) {
            let (Some(name), Some(namespace)) = (&pod.metadata.name, &pod.metadata.namespace)
            else {
                continue;
            };
            let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            api.evict(name, &EvictParams::default())
                .await
                .map_err(|e| CloudError::Kube(format!("failed to evict {namespace}/{name}: {e}")))?;
            tracing::debug!(node, pod = %name, namespace = %namespace, "evicted");
        }
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(kube_err)?;
        Ok(())
    }

    async fn list_secrets(&self, namespace: &str, secret_type: &str) -> Result<Vec<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().fields(&format!("type={secret_type}")))
            .await
            .map_err(kube_err)?;
        Ok(list
            .items
            .into_iter()
            .map(|s| SecretData {
                name: s.metadata.name.unwrap_or_default(),
                secret_type: s.type_.unwrap_or_default(),
                data: s
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                    .collect(),
            })
            .collect())
    }

    async fn create_secret(&self, namespace: &str, secret: &SecretData) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let object = Secret {
            metadata: ObjectMeta {
                name: Some(secret.name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some(secret.secret_type.clone()),
            string_data: Some(secret.data.clone()),
            ..Default::default()
        };
        api.create(&PostParams::default(), &object)
            .await
            .map_err(kube_err)?;
        Ok(())
    }

    async fn apply_manifests(&self, manifests: &str) -> Result<()> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(kube_err)?;

        for obj in parse_manifests(manifests)? {
            self.apply_one(&discovery, obj).await?;
        }
        Ok(())
    }

    async fn namespace_uid(&self, name: &str) -> Result<String> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api.get(name).await.map_err(kube_err)?;
        ns.metadata
            .uid
            .ok_or_else(|| CloudError::Kube(format!("namespace {name} has no uid")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_kubeconfig_embeds_credentials() {
        let endpoint = KubeEndpoint {
            cluster_name: "demo.fleetforge".to_string(),
            user_name: "cluster-admin@demo.fleetforge".to_string(),
            server: "https://203.0.113.7:6443".to_string(),
            ca_pem: "CA".to_string(),
            client_cert_pem: "CERT".to_string(),
            client_key_pem: "KEY".to_string(),
        };

        let kubeconfig = admin_kubeconfig(&endpoint).unwrap();
        assert_eq!(
            kubeconfig.current_context.as_deref(),
            Some("cluster-admin@demo.fleetforge")
        );
        assert_eq!(kubeconfig.contexts.len(), 1);
        assert_eq!(kubeconfig.contexts[0].name, "cluster-admin@demo.fleetforge");
        let cluster = kubeconfig.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://203.0.113.7:6443"));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some(STANDARD.encode("CA").as_str())
        );
    }

    #[test]
    fn test_parse_manifests_skips_empty_documents() {
        let bundle = "---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
        let objects = parse_manifests(bundle).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["kind"], "Namespace");
        assert_eq!(objects[1]["metadata"]["name"], "b");
    }

    #[test]
    fn test_daemonset_and_mirror_pods_are_skipped() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut pod = Pod::default();
        assert!(evictable(&pod));

        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            ..Default::default()
        }]);
        assert!(!evictable(&pod));

        let mut mirror = Pod::default();
        mirror.metadata.annotations = Some(
            [(MIRROR_POD_ANNOTATION.to_string(), "x".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!evictable(&mirror));
    }
}
