//! Control-plane bootstrap and node joins with `kubeadm`.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument};

use dpusim_core::config::ClusterConfig;

use crate::remote::RemoteShell;

pub const API_SERVER_PORT: u16 = 6443;

const INIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const JOIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(60);
const ADMIN_CONF_TIMEOUT: Duration = Duration::from_secs(30);

const ROOT_KUBECTL_SCRIPT: &str = "set -e
mkdir -p /root/.kube
sudo cp /etc/kubernetes/admin.conf /root/.kube/config
sudo chown root:root /root/.kube/config
";

/// Everything later nodes and the CNI installer need from the first master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterBootstrapResult {
    pub worker_join_command: String,
    pub control_plane_join_command: String,
    pub api_server_endpoint: String,
    #[serde(skip)]
    pub kubeconfig: String,
}

pub fn api_server_endpoint(ip: Ipv4Addr) -> String {
    format!("https://{}:{}", ip, API_SERVER_PORT)
}

pub fn init_script(cluster: &ClusterConfig, advertise: Ipv4Addr) -> String {
    format!(
        "set -e\nsudo kubeadm init --pod-network-cidr={} --service-cidr={} \
         --apiserver-advertise-address={} --upload-certs\n",
        cluster.pod_cidr, cluster.service_cidr, advertise
    )
}

pub fn control_plane_join_command(worker_join: &str, certificate_key: &str) -> String {
    format!(
        "{} --control-plane --certificate-key {}",
        worker_join, certificate_key
    )
}

/// `kubeadm init` on the first master at `mgmt_ip`, advertising the API on
/// `k8s_ip`, then collect join commands and the admin kubeconfig.
#[instrument(skip_all, fields(node, cluster = %cluster.name))]
pub fn initialize_control_plane(
    shell: &dyn RemoteShell,
    node: &str,
    mgmt_ip: Ipv4Addr,
    k8s_ip: Ipv4Addr,
    cluster: &ClusterConfig,
) -> Result<ClusterBootstrapResult> {
    info!(
        node,
        %mgmt_ip,
        %k8s_ip,
        pod_cidr = %cluster.pod_cidr,
        service_cidr = %cluster.service_cidr,
        "initializing control plane"
    );
    let out = shell
        .run(mgmt_ip, &init_script(cluster, k8s_ip), INIT_TIMEOUT)
        .context("control plane initialization failed")?;
    debug!(node, output = %out, "kubeadm init finished");

    setup_root_kubectl(shell, mgmt_ip).context("Failed to set up kubectl for root")?;

    let worker_join_command = shell
        .run(
            mgmt_ip,
            "set -e\nsudo kubeadm token create --print-join-command\n",
            TOKEN_TIMEOUT,
        )
        .context("Failed to extract worker join command")?;
    if worker_join_command.is_empty() {
        bail!("kubeadm printed an empty join command on {}", node);
    }

    let certificate_key = shell
        .run(
            mgmt_ip,
            "set -e\nsudo kubeadm init phase upload-certs --upload-certs 2>/dev/null | tail -1\n",
            TOKEN_TIMEOUT,
        )
        .context("Failed to generate certificate key")?;
    if certificate_key.is_empty() {
        bail!("kubeadm printed an empty certificate key on {}", node);
    }

    let kubeconfig = shell
        .run(mgmt_ip, "sudo cat /etc/kubernetes/admin.conf", ADMIN_CONF_TIMEOUT)
        .context("Failed to read admin kubeconfig")?;

    let result = ClusterBootstrapResult {
        control_plane_join_command: control_plane_join_command(
            &worker_join_command,
            &certificate_key,
        ),
        worker_join_command,
        api_server_endpoint: api_server_endpoint(k8s_ip),
        kubeconfig,
    };
    info!(node, endpoint = %result.api_server_endpoint, "control plane initialized");
    Ok(result)
}

pub fn setup_root_kubectl(shell: &dyn RemoteShell, ip: Ipv4Addr) -> Result<()> {
    shell.run(ip, ROOT_KUBECTL_SCRIPT, TOKEN_TIMEOUT)?;
    Ok(())
}

#[instrument(skip_all, fields(node))]
pub fn join_control_plane(
    shell: &dyn RemoteShell,
    node: &str,
    ip: Ipv4Addr,
    bootstrap: &ClusterBootstrapResult,
) -> Result<()> {
    info!(node, %ip, "joining control plane node");
    shell
        .run(ip, &join_script(&bootstrap.control_plane_join_command), JOIN_TIMEOUT)
        .context("Failed to join control plane node")?;
    setup_root_kubectl(shell, ip).context("Failed to set up kubectl for root")?;
    info!(node, "control plane node joined");
    Ok(())
}

#[instrument(skip_all, fields(node))]
pub fn join_worker(
    shell: &dyn RemoteShell,
    node: &str,
    ip: Ipv4Addr,
    bootstrap: &ClusterBootstrapResult,
) -> Result<()> {
    info!(node, %ip, "joining worker node");
    shell
        .run(ip, &join_script(&bootstrap.worker_join_command), JOIN_TIMEOUT)
        .context("Failed to join worker node")?;
    info!(node, "worker node joined");
    Ok(())
}

fn join_script(command: &str) -> String {
    format!("set -e\nsudo {}\n", command)
}
