//! kubeadm startup scripts
//!
//! Rendered into Sakura Cloud notes and attached to servers at creation,
//! so they run once on first boot.

use fleetforge_cloud::Certificates;
use fleetforge_core::Cluster;
use std::collections::BTreeMap;

const KUBEADM_PREREQUISITES: &str = r#"
echo ">>> コンテナランタイムと kubeadm をインストール中..."
export DEBIAN_FRONTEND=noninteractive
swapoff -a
sed -i '/ swap / s/^/#/' /etc/fstab
modprobe overlay
modprobe br_netfilter
cat > /etc/sysctl.d/99-kubernetes.conf <<'EOF'
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF
sysctl --system
apt-get update
apt-get install -y apt-transport-https ca-certificates curl gpg containerd
mkdir -p /etc/containerd
containerd config default | sed 's/SystemdCgroup = false/SystemdCgroup = true/' > /etc/containerd/config.toml
systemctl restart containerd
mkdir -p /etc/apt/keyrings
curl -fsSL "https://pkgs.k8s.io/core:/stable:/${KUBE_MINOR}/deb/Release.key" | gpg --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo "deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/${KUBE_MINOR}/deb/ /" > /etc/apt/sources.list.d/kubernetes.list
apt-get update
apt-get install -y "kubelet=${KUBE_PKG}-*" "kubeadm=${KUBE_PKG}-*" "kubectl=${KUBE_PKG}-*"
apt-mark hold kubelet kubeadm kubectl
"#;

/// `v1.29.3` -> (`v1.29`, `1.29.3`)
fn package_versions(version: &str) -> (String, String) {
    let bare = version.trim_start_matches('v');
    let minor = bare.splitn(3, '.').take(2).collect::<Vec<_>>().join(".");
    (format!("v{minor}"), bare.to_string())
}

fn header(name: &str, desc: &str, version: &str) -> String {
    let (minor, pkg) = package_versions(version);
    format!(
        "#!/bin/bash\n\
         # @sacloud-name \"{name}\"\n\
         # @sacloud-once\n\
         # @sacloud-desc FleetForge: {desc}\n\
         \n\
         set -euo pipefail\n\
         \n\
         KUBE_MINOR=\"{minor}\"\n\
         KUBE_PKG=\"{pkg}\"\n\
         {KUBEADM_PREREQUISITES}"
    )
}

fn write_pem(path: &str, pem: &str) -> String {
    format!("cat > {path} <<'EOF'\n{}\nEOF\n", pem.trim_end())
}

fn extra_args(args: &BTreeMap<String, String>) -> String {
    if args.is_empty() {
        return String::new();
    }
    let mut out = "  extraArgs:\n".to_string();
    for (key, value) in args {
        out.push_str(&format!("    {key}: \"{value}\"\n"));
    }
    out
}

fn component(name: &str, args: &BTreeMap<String, String>) -> String {
    if args.is_empty() {
        return String::new();
    }
    format!("{name}:\n{}", extra_args(args))
}

/// First-boot script for a master: installs kubeadm, drops the cluster's CAs
/// into `/etc/kubernetes/pki` and runs `kubeadm init`.
///
/// kubeadm adds the advertise address to the serving cert on its own, so only
/// extra SANs from the cluster config are listed.
pub fn master_script(cluster: &Cluster, certs: &Certificates) -> String {
    let config = &cluster.config;
    let sans_yaml: String = config
        .api_server_cert_sans
        .iter()
        .map(|s| format!("  - \"{s}\"\n"))
        .collect();

    let mut script = header(
        &format!("fleetforge-{}-master", cluster.name()),
        "kubeadm でコントロールプレーンを初期化",
        &config.kubernetes_version,
    );

    script.push_str("\necho \">>> クラスター証明書を配置中...\"\n");
    script.push_str("mkdir -p /etc/kubernetes/pki/etcd\n");
    script.push_str(&write_pem("/etc/kubernetes/pki/ca.crt", &certs.ca.cert_pem));
    script.push_str(&write_pem("/etc/kubernetes/pki/ca.key", &certs.ca.key_pem));
    script.push_str(&write_pem(
        "/etc/kubernetes/pki/front-proxy-ca.crt",
        &certs.front_proxy_ca.cert_pem,
    ));
    script.push_str(&write_pem(
        "/etc/kubernetes/pki/front-proxy-ca.key",
        &certs.front_proxy_ca.key_pem,
    ));
    script.push_str(&write_pem("/etc/kubernetes/pki/sa.key", &certs.service_account.key_pem));
    script.push_str(
        "openssl pkey -in /etc/kubernetes/pki/sa.key -pubout -out /etc/kubernetes/pki/sa.pub\n",
    );
    script.push_str(&write_pem("/etc/kubernetes/pki/etcd/ca.crt", &certs.etcd_ca.cert_pem));
    script.push_str(&write_pem("/etc/kubernetes/pki/etcd/ca.key", &certs.etcd_ca.key_pem));
    script.push_str("chmod 600 /etc/kubernetes/pki/*.key /etc/kubernetes/pki/etcd/*.key\n");

    script.push_str(&format!(
        "\ncat > /etc/kubernetes/kubeadm.yaml <<'EOF'\n\
         apiVersion: kubeadm.k8s.io/v1beta3\n\
         kind: ClusterConfiguration\n\
         clusterName: {name}\n\
         kubernetesVersion: {version}\n\
         networking:\n  podSubnet: 10.244.0.0/16\n\
         apiServer:\n  certSANs:\n{sans_yaml}{api_args}\
         {cm_args}{sched_args}EOF\n",
        name = cluster.name(),
        version = config.kubernetes_version,
        api_args = extra_args(&config.api_server_extra_args),
        cm_args = component("controllerManager", &config.controller_manager_extra_args),
        sched_args = component("scheduler", &config.scheduler_extra_args),
    ));

    script.push_str(
        "\necho \">>> kubeadm init を実行中...\"\n\
         kubeadm init --config /etc/kubernetes/kubeadm.yaml --skip-phases=addon/kube-proxy --upload-certs\n\
         kubeadm init phase addon kube-proxy --config /etc/kubernetes/kubeadm.yaml\n\
         mkdir -p /root/.kube\n\
         cp /etc/kubernetes/admin.conf /root/.kube/config\n",
    );

    if config.network_provider == "flannel" {
        script.push_str(
            "kubectl apply -f https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml\n",
        );
    }

    script.push_str(
        "\n# リモートアップグレード用\n\
         sed -i 's/^#\\?PermitRootLogin.*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config\n\
         systemctl reload ssh || systemctl reload sshd\n\
         \n\
         echo \"✅ コントロールプレーン初期化完了\"\n",
    );
    script
}

/// First-boot script for a worker: installs kubeadm and joins `api_endpoint`.
pub fn node_script(cluster: &Cluster, api_endpoint: &str, token: &str, provider_id: &str) -> String {
    let mut script = header(
        &format!("fleetforge-{}-node", cluster.name()),
        "kubeadm でワーカーノードを参加",
        &cluster.config.kubernetes_version,
    );
    script.push_str(&format!(
        "\necho \"KUBELET_EXTRA_ARGS=--provider-id={provider_id}\" > /etc/default/kubelet\n\
         \n\
         echo \">>> kubeadm join を実行中...\"\n\
         kubeadm join {api_endpoint} --token {token} --discovery-token-unsafe-skip-ca-verification\n\
         \n\
         sed -i 's/^#\\?PermitRootLogin.*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config\n\
         systemctl reload ssh || systemctl reload sshd\n\
         \n\
         echo \"✅ ノード参加完了\"\n"
    ));
    script
}
