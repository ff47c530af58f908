//! Guest preparation for kubeadm: container runtime, Open vSwitch and the
//! Kubernetes packages.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument};

use dpusim_core::poll::PollPolicy;

use crate::remote::RemoteShell;

const STEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Distribution facts from `/etc/os-release`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Distro {
    pub id: String,
    pub version_id: String,
    pub id_like: String,
}

impl Distro {
    pub fn parse(os_release: &str) -> Self {
        let mut distro = Distro::default();
        for line in os_release.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim_matches(|c| c == '"' || c == '\'').to_string();
            match key {
                "ID" => distro.id = value,
                "VERSION_ID" => distro.version_id = value,
                "ID_LIKE" => distro.id_like = value,
                _ => {}
            }
        }
        distro
    }

    /// Fedora, RHEL and their rebuilds.
    pub fn uses_dnf(&self) -> bool {
        matches!(
            self.id.as_str(),
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux"
        ) || self
            .id_like
            .split_whitespace()
            .any(|like| like == "fedora" || like == "rhel")
    }
}

pub fn detect_distro(shell: &dyn RemoteShell, ip: Ipv4Addr) -> Result<Distro> {
    let content = shell
        .run(ip, "cat /etc/os-release", PROBE_TIMEOUT)
        .context("Failed to read /etc/os-release")?;
    Ok(Distro::parse(&content))
}

/// One named install step, run as a single remote script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepStep {
    pub name: &'static str,
    pub script: String,
}

fn step(name: &'static str, script: String) -> PrepStep {
    PrepStep { name, script }
}

/// The dnf install sequence for Kubernetes `version` (e.g. `1.33`).
pub fn install_steps(hostname: &str, version: &str) -> Vec<PrepStep> {
    vec![
        step(
            "disable swap",
            "set -e\nsudo swapoff -a\nsudo sed -i '/ swap / s/^/#/' /etc/fstab\n".to_string(),
        ),
        step(
            "set hostname",
            format!("set -e\nsudo hostnamectl set-hostname {}\n", hostname),
        ),
        step(
            "configure kernel modules",
            "set -e
sudo tee /etc/modules-load.d/k8s.conf > /dev/null <<EOF
overlay
br_netfilter
EOF
sudo modprobe overlay
sudo modprobe br_netfilter
sudo tee /etc/sysctl.d/k8s.conf > /dev/null <<EOF
net.bridge.bridge-nf-call-iptables = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward = 1
EOF
sudo sysctl --system > /dev/null 2>&1
"
            .to_string(),
        ),
        step(
            "install CRI-O",
            format!(
                "set -e
sudo tee /etc/yum.repos.d/cri-o.repo > /dev/null <<EOF
[cri-o]
name=CRI-O
baseurl=https://pkgs.k8s.io/addons:/cri-o:/stable:/v{v}/rpm/
enabled=1
gpgcheck=1
gpgkey=https://pkgs.k8s.io/addons:/cri-o:/stable:/v{v}/rpm/repodata/repomd.xml.key
EOF
sudo dnf install -y cri-o iproute-tc containernetworking-plugins > /dev/null 2>&1
sudo mkdir -p /opt/cni/bin
sudo ln -sf /usr/libexec/cni/* /opt/cni/bin/
sudo systemctl enable crio > /dev/null 2>&1
sudo systemctl start crio
",
                v = version
            ),
        ),
        step(
            "install Open vSwitch",
            "set -e
sudo dnf install -y NetworkManager-ovs > /dev/null 2>&1
sudo dnf install -y openvswitch > /dev/null 2>&1
sudo systemctl enable openvswitch > /dev/null 2>&1
sudo systemctl restart NetworkManager > /dev/null 2>&1
sudo systemctl start openvswitch
"
            .to_string(),
        ),
        step(
            "add Kubernetes repository",
            format!(
                "set -e
sudo tee /etc/yum.repos.d/kubernetes.repo > /dev/null <<EOF
[kubernetes]
name=Kubernetes
baseurl=https://pkgs.k8s.io/core:/stable:/v{v}/rpm/
enabled=1
gpgcheck=1
gpgkey=https://pkgs.k8s.io/core:/stable:/v{v}/rpm/repodata/repomd.xml.key
exclude=kubelet kubeadm kubectl cri-tools kubernetes-cni
EOF
",
                v = version
            ),
        ),
        step(
            "install kubelet, kubeadm and kubectl",
            "set -e
sudo dnf install -y kubelet kubeadm kubectl --setopt=disable_excludes=kubernetes > /dev/null 2>&1
sudo systemctl enable kubelet > /dev/null 2>&1
"
            .to_string(),
        ),
        step(
            "disable firewall",
            "set -e
if rpm -q firewalld &>/dev/null; then
  sudo systemctl disable --now firewalld
  sudo dnf remove -y firewalld
fi
"
            .to_string(),
        ),
    ]
}

/// Wait for SSH, check the distro, install everything, then verify.
#[instrument(skip_all, fields(node, %ip))]
pub fn prepare_node(
    shell: &dyn RemoteShell,
    node: &str,
    ip: Ipv4Addr,
    version: &str,
    ssh_ready: PollPolicy,
) -> Result<()> {
    info!(node, %ip, version, "installing Kubernetes");
    shell
        .wait_until_ready(ip, ssh_ready)
        .with_context(|| format!("Failed to wait for SSH on {}", node))?;

    let distro = detect_distro(shell, ip)?;
    if !distro.uses_dnf() {
        bail!(
            "unsupported Linux distribution '{}' on {}: only dnf-based distributions are supported",
            distro.id,
            node
        );
    }
    info!(node, distro = %distro.id, version_id = %distro.version_id, "detected distribution");

    for s in install_steps(node, version) {
        shell
            .run(ip, &s.script, STEP_TIMEOUT)
            .with_context(|| format!("Failed to {} on {}", s.name, node))?;
        info!(node, step = s.name, "done");
    }

    verify(shell, node, ip)?;
    info!(node, version, "Kubernetes installed");
    Ok(())
}

fn verify(shell: &dyn RemoteShell, node: &str, ip: Ipv4Addr) -> Result<()> {
    let kubeadm = shell
        .run(ip, "set -e\nsudo kubeadm version -o short 2>/dev/null\n", STEP_TIMEOUT)
        .context("Failed to verify Kubernetes installation")?;
    shell
        .run(ip, "sudo systemctl is-active crio\n", STEP_TIMEOUT)
        .context("Failed to verify CRI-O installation")?;
    let ovs = shell
        .run(ip, "set -e\nsudo ovs-vsctl --version | head -n 1\n", STEP_TIMEOUT)
        .context("Failed to verify Open vSwitch installation")?;
    info!(node, kubeadm = %kubeadm, ovs = %ovs, "verified node packages");
    Ok(())
}
