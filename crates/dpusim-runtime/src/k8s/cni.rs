//! CNI installation from the host, driven through `kubectl --kubeconfig`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use dpusim_core::config::{ClusterConfig, CniType};
use dpusim_core::error::ConfigRefError;

use super::kubeadm::api_server_endpoint;
use crate::shell;

pub const FLANNEL_MANIFEST_URL: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";
pub const OVN_KUBERNETES_IMAGE: &str = "ghcr.io/ovn-kubernetes/ovn-kubernetes/ovn-kube-fedora:master";

const FLANNEL_NAMESPACE: &str = "kube-flannel";
const OVN_NAMESPACE: &str = "ovn-kubernetes";
const FLANNEL_WAIT: &str = "180s";
const OVN_WAIT: &str = "300s";

const NETWORK_POLICY_API_CRDS: [&str; 2] = [
    "https://raw.githubusercontent.com/kubernetes-sigs/network-policy-api/v0.1.5/config/crd/experimental/policy.networking.k8s.io_adminnetworkpolicies.yaml",
    "https://raw.githubusercontent.com/kubernetes-sigs/network-policy-api/v0.1.5/config/crd/experimental/policy.networking.k8s.io_baselineadminnetworkpolicies.yaml",
];

const OVN_CRDS: [&str; 10] = [
    "k8s.ovn.org_egressfirewalls.yaml",
    "k8s.ovn.org_egressips.yaml",
    "k8s.ovn.org_egressqoses.yaml",
    "k8s.ovn.org_egressservices.yaml",
    "k8s.ovn.org_adminpolicybasedexternalroutes.yaml",
    "k8s.ovn.org_networkqoses.yaml",
    "k8s.ovn.org_userdefinednetworks.yaml",
    "k8s.ovn.org_clusteruserdefinednetworks.yaml",
    "k8s.ovn.org_routeadvertisements.yaml",
    "k8s.ovn.org_clusternetworkconnects.yaml",
];

const OVN_SETUP: [&str; 6] = [
    "ovn-setup.yaml",
    "rbac-ovnkube-identity.yaml",
    "rbac-ovnkube-cluster-manager.yaml",
    "rbac-ovnkube-master.yaml",
    "rbac-ovnkube-node.yaml",
    "rbac-ovnkube-db.yaml",
];

const OVN_DEPLOYMENTS: [&str; 4] = [
    "ovnkube-identity.yaml",
    "ovnkube-db.yaml",
    "ovnkube-master.yaml",
    "ovnkube-node.yaml",
];

/// What a CNI install needs to know about the freshly initialized cluster.
#[derive(Debug, Clone, Copy)]
pub struct CniTarget<'a> {
    pub cluster: &'a ClusterConfig,
    pub kubeconfig: &'a Path,
    /// k8s-network address of the first master.
    pub api_ip: Ipv4Addr,
    pub masters: &'a [&'a str],
}

pub trait CniInstaller {
    fn install(&self, target: &CniTarget<'_>) -> Result<()>;
}

/// OVN-Kubernetes needs `br-ex` on every node before the CNI starts.
pub fn requires_guest_bridge(cni: CniType) -> bool {
    cni == CniType::OvnKubernetes
}

pub fn ensure_supported(cni: CniType) -> Result<(), ConfigRefError> {
    match cni {
        CniType::Kindnet => Err(ConfigRefError::UnsupportedCni(cni.to_string())),
        CniType::Flannel | CniType::OvnKubernetes => Ok(()),
    }
}

/// Installs manifests with the host's `kubectl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubectlCni;

impl CniInstaller for KubectlCni {
    #[instrument(skip_all, fields(cluster = %target.cluster.name, cni = %target.cluster.cni))]
    fn install(&self, target: &CniTarget<'_>) -> Result<()> {
        match target.cluster.cni {
            CniType::Flannel => install_flannel(target),
            CniType::OvnKubernetes => install_ovn_kubernetes(target),
            cni @ CniType::Kindnet => Err(ConfigRefError::UnsupportedCni(cni.to_string()).into()),
        }
    }
}

fn kubectl(kubeconfig: &Path, args: &[&str]) -> Result<String> {
    let kc = kubeconfig.to_string_lossy();
    let mut full = vec!["--kubeconfig", kc.as_ref()];
    full.extend_from_slice(args);
    shell::run_host_checked("kubectl", &full)
}

fn apply(kubeconfig: &Path, manifest: &str) -> Result<()> {
    kubectl(kubeconfig, &["apply", "-f", manifest])
        .with_context(|| format!("Failed to apply {}", manifest))?;
    Ok(())
}

fn wait_for_pods(kubeconfig: &Path, namespace: &str, timeout: &str) -> Result<()> {
    let timeout = format!("--timeout={}", timeout);
    kubectl(
        kubeconfig,
        &[
            "wait",
            "--for=condition=Ready",
            "pods",
            "--all",
            "-n",
            namespace,
            &timeout,
        ],
    )?;
    Ok(())
}

pub fn flannel_net_conf(pod_cidr: &str) -> String {
    serde_json::json!({
        "Network": pod_cidr,
        "Backend": { "Type": "vxlan" },
    })
    .to_string()
}

fn install_flannel(target: &CniTarget<'_>) -> Result<()> {
    let kc = target.kubeconfig;
    info!(cluster = %target.cluster.name, "installing Flannel");
    apply(kc, FLANNEL_MANIFEST_URL).context("Failed to install Flannel")?;

    let patch = serde_json::json!({
        "data": { "net-conf.json": flannel_net_conf(&target.cluster.pod_cidr) }
    })
    .to_string();
    if let Err(e) = kubectl(
        kc,
        &[
            "patch",
            "configmap",
            "kube-flannel-cfg",
            "-n",
            FLANNEL_NAMESPACE,
            "--type",
            "merge",
            "-p",
            &patch,
        ],
    ) {
        warn!(error = %format!("{:#}", e), "failed to set Flannel pod CIDR");
    }
    if let Err(e) = kubectl(
        kc,
        &["rollout", "restart", "ds", "kube-flannel-ds", "-n", FLANNEL_NAMESPACE],
    ) {
        warn!(error = %format!("{:#}", e), "failed to restart Flannel daemonset");
    }
    if let Err(e) = wait_for_pods(kc, FLANNEL_NAMESPACE, FLANNEL_WAIT) {
        warn!(error = %format!("{:#}", e), "Flannel pods not ready yet");
    }
    info!(cluster = %target.cluster.name, "Flannel installed");
    Ok(())
}

/// Arguments for `dist/images/daemonset.sh`, which renders the manifests.
pub fn daemonset_args(cluster: &ClusterConfig, api_ip: Ipv4Addr) -> Vec<String> {
    vec![
        format!("--image={}", OVN_KUBERNETES_IMAGE),
        format!("--net-cidr={}", cluster.pod_cidr),
        format!("--svc-cidr={}", cluster.service_cidr),
        "--gateway-mode=shared".to_string(),
        format!("--k8s-apiserver={}", api_server_endpoint(api_ip)),
        "--multicast-enabled".to_string(),
        "--admin-network-policy-enable=true".to_string(),
    ]
}

fn ovn_source(cluster: &ClusterConfig) -> Result<PathBuf> {
    let path = cluster.ovn_kubernetes_path.clone().ok_or_else(|| {
        anyhow!(
            "cluster {} uses ovn-kubernetes but no ovn_kubernetes_path is set",
            cluster.name
        )
    })?;
    let images = path.join("dist/images");
    if !images.join("daemonset.sh").is_file() {
        anyhow::bail!(
            "OVN-Kubernetes source not found at {} (missing dist/images/daemonset.sh)",
            path.display()
        );
    }
    Ok(path)
}

fn install_ovn_kubernetes(target: &CniTarget<'_>) -> Result<()> {
    let kc = target.kubeconfig;
    let cluster = target.cluster;
    let source = ovn_source(cluster)?;
    info!(cluster = %cluster.name, source = %source.display(), "installing OVN-Kubernetes");

    let images = source.join("dist/images");
    let args = daemonset_args(cluster, target.api_ip);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    shell::run_host_checked_in(&images, "./daemonset.sh", &args)
        .context("Failed to generate OVN-Kubernetes manifests")?;

    let yaml = source.join("dist/yaml");
    let manifest = |name: &str| yaml.join(name).to_string_lossy().into_owned();

    for crd in OVN_CRDS {
        apply(kc, &manifest(crd)).context("Failed to apply OVN-Kubernetes CRDs")?;
    }
    for url in NETWORK_POLICY_API_CRDS {
        apply(kc, url).context("Failed to apply network policy API CRDs")?;
    }
    for name in OVN_SETUP {
        apply(kc, &manifest(name)).context("Failed to apply OVN-Kubernetes setup")?;
    }

    for &master in target.masters {
        kubectl(
            kc,
            &["label", "node", master, "k8s.ovn.org/ovnkube-db=true", "--overwrite"],
        )
        .with_context(|| format!("Failed to label node {}", master))?;
        for taint in [
            "node-role.kubernetes.io/master:NoSchedule-",
            "node-role.kubernetes.io/control-plane:NoSchedule-",
        ] {
            // Absent taints make kubectl exit non-zero.
            let _ = kubectl(kc, &["taint", "node", master, taint]);
        }
    }

    for name in OVN_DEPLOYMENTS {
        apply(kc, &manifest(name)).context("Failed to apply OVN-Kubernetes deployments")?;
    }

    if let Err(e) = wait_for_pods(kc, OVN_NAMESPACE, OVN_WAIT) {
        warn!(error = %format!("{:#}", e), "OVN-Kubernetes pods not ready yet");
    }
    kubectl(
        kc,
        &["delete", "ds", "kube-proxy", "-n", "kube-system", "--ignore-not-found"],
    )
    .context("Failed to remove kube-proxy")?;

    info!(cluster = %cluster.name, "OVN-Kubernetes installed");
    Ok(())
}
