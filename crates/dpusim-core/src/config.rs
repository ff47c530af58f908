use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::ConfigRefError;
use crate::naming;

/// Network type label for the management network (SSH, IP discovery).
pub const MGMT_NETWORK_TYPE: &str = "mgmt";
/// Network type label for the Kubernetes node network.
pub const K8S_NETWORK_TYPE: &str = "k8s";

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "DPUSIM_CONFIG";

/// Libvirt connection URI used for every hypervisor call.
pub const LIBVIRT_URI: &str = "qemu:///system";
/// Where base images, VM disks and cloud-init seeds live.
pub const DEFAULT_IMAGE_DIR: &str = "/var/lib/libvirt/images";
/// Where per-VM UEFI variable stores live.
pub const DEFAULT_NVRAM_DIR: &str = "/var/lib/libvirt/qemu/nvram";

/// Effective config path: `DPUSIM_CONFIG` if set, else `config.yaml`.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Complete simulator configuration as read from YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub vms: Vec<VmConfig>,
    #[serde(default)]
    pub operating_system: OsConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

/// How a libvirt network forwards traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Nat,
    L2Bridge,
}

impl FromStr for NetworkMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nat" => Ok(NetworkMode::Nat),
            "l2-bridge" => Ok(NetworkMode::L2Bridge),
            other => bail!("unknown network mode '{}' (expected 'nat' or 'l2-bridge')", other),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Nat => write!(f, "nat"),
            NetworkMode::L2Bridge => write!(f, "l2-bridge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    /// Free-form label; `mgmt` and `k8s` carry special meaning.
    #[serde(rename = "type")]
    pub net_type: String,
    pub bridge_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_start: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp_end: Option<Ipv4Addr>,
    /// Kept as text so an unknown mode surfaces as a provisioning error
    /// naming the network rather than a YAML parse failure.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_nic_model")]
    pub nic_model: String,
    #[serde(default)]
    pub use_ovs: bool,
    /// `any`, `host` or `dpu`.
    #[serde(default = "default_attach_to")]
    pub attach_to: String,
}

fn default_mode() -> String {
    "nat".to_string()
}
fn default_nic_model() -> String {
    "virtio".to_string()
}
fn default_attach_to() -> String {
    "any".to_string()
}

impl NetworkConfig {
    /// Parsed forwarding mode, failing on anything but `nat`/`l2-bridge`.
    pub fn mode(&self) -> Result<NetworkMode, ConfigRefError> {
        self.mode
            .parse()
            .map_err(|_| ConfigRefError::UnsupportedNetworkMode {
                network: self.name.clone(),
                mode: self.mode.clone(),
            })
    }

    /// Subnet derived from gateway and mask, e.g. `192.168.120.0/24`.
    pub fn subnet_cidr(&self) -> Option<Ipv4Network> {
        let net = Ipv4Network::with_netmask(self.gateway?, self.subnet_mask?).ok()?;
        Ipv4Network::new(net.network(), net.prefix()).ok()
    }

    /// Whether a VM of `vm_type` gets an interface on this network.
    pub fn attaches_to(&self, vm_type: VmType) -> bool {
        self.attach_to == "any" || self.attach_to == vm_type.as_str()
    }

    pub fn is_k8s(&self) -> bool {
        self.net_type == K8S_NETWORK_TYPE
    }
}

/// Whether a VM plays the server or the DPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Host,
    Dpu,
}

impl VmType {
    pub fn as_str(self) -> &'static str {
        match self {
            VmType::Host => "host",
            VmType::Dpu => "dpu",
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub vm_type: VmType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_node_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_node_ip: Option<Ipv4Addr>,
    /// For DPUs: the host VM this DPU is plugged into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// MiB.
    #[serde(default)]
    pub memory: u32,
    #[serde(default)]
    pub vcpus: u32,
    /// GiB.
    #[serde(default)]
    pub disk_size: u32,
}

impl VmConfig {
    pub fn is_dpu(&self) -> bool {
        self.vm_type == VmType::Dpu
    }

    /// The host this DPU names, ignoring an empty string.
    pub fn host_ref(&self) -> Option<&str> {
        self.host.as_deref().filter(|h| !h.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// OCI artifact reference pulled with `oras`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub image_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub key_path: PathBuf,
    #[serde(default = "default_ssh_password")]
    pub password: String,
}

fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_ssh_password() -> String {
    "redhat".to_string()
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            key_path: PathBuf::new(),
            password: default_ssh_password(),
        }
    }
}

impl SshConfig {
    /// Matching public key, `<key_path>.pub`.
    pub fn public_key_path(&self) -> PathBuf {
        let mut p = self.key_path.clone().into_os_string();
        p.push(".pub");
        PathBuf::from(p)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_k8s_version")]
    pub version: String,
    #[serde(default = "default_kubeconfig_dir")]
    pub kubeconfig_dir: PathBuf,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

fn default_k8s_version() -> String {
    "1.33".to_string()
}
fn default_kubeconfig_dir() -> PathBuf {
    PathBuf::from("kubeconfig")
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            version: default_k8s_version(),
            kubeconfig_dir: default_kubeconfig_dir(),
            clusters: Vec::new(),
        }
    }
}

/// Supported cluster network plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CniType {
    Flannel,
    OvnKubernetes,
    Kindnet,
}

impl CniType {
    pub fn as_str(self) -> &'static str {
        match self {
            CniType::Flannel => "flannel",
            CniType::OvnKubernetes => "ovn-kubernetes",
            CniType::Kindnet => "kindnet",
        }
    }
}

impl fmt::Display for CniType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    pub cni: CniType,
    /// Local ovn-kubernetes source checkout, used to render its manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn_kubernetes_path: Option<PathBuf>,
}

fn default_pod_cidr() -> String {
    "10.244.0.0/16".to_string()
}
fn default_service_cidr() -> String {
    "10.245.0.0/16".to_string()
}

impl SimConfig {
    /// Load, default and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse, default and validate a YAML document.
    pub fn parse(s: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(s).context("Failed to parse config YAML")?;
        config.validate_and_set_defaults()?;
        Ok(config)
    }

    /// Fill blank optional fields and check every cross-reference.
    ///
    /// All problems are reported together as one error.
    pub fn validate_and_set_defaults(&mut self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let mut net_names = HashSet::new();
        for (i, net) in self.networks.iter_mut().enumerate() {
            if net.name.is_empty() {
                errors.push(format!("networks[{}]: 'name' is required", i));
            } else if !net_names.insert(net.name.clone()) {
                errors.push(format!("networks[{}] ({}): duplicate network name", i, net.name));
            }
            if net.net_type.is_empty() {
                errors.push(format!("networks[{}] ({}): 'type' is required", i, net.name));
            }
            if net.bridge_name.is_empty() {
                errors.push(format!("networks[{}] ({}): 'bridge_name' is required", i, net.name));
            } else if let Err(e) = naming::validate_bridge_name(&net.bridge_name) {
                errors.push(format!("networks[{}] ({}): {}", i, net.name, e));
            }
            if net.mode.is_empty() {
                net.mode = default_mode();
            }
            if net.nic_model.is_empty() {
                net.nic_model = default_nic_model();
            }
            if net.attach_to.is_empty() {
                net.attach_to = default_attach_to();
            }
            if let Err(e) = net.mode() {
                errors.push(format!("networks[{}]: {}", i, e));
            }
            if !matches!(net.attach_to.as_str(), "any" | "host" | "dpu") {
                errors.push(format!(
                    "networks[{}] ({}): 'attach_to' must be 'any', 'host' or 'dpu', got '{}'",
                    i, net.name, net.attach_to
                ));
            }
            if net.gateway.is_some() != net.subnet_mask.is_some() {
                errors.push(format!(
                    "networks[{}] ({}): 'gateway' and 'subnet_mask' must be set together",
                    i, net.name
                ));
            }
        }

        let host_names: HashSet<&str> = self
            .vms
            .iter()
            .filter(|vm| vm.vm_type == VmType::Host)
            .map(|vm| vm.name.as_str())
            .collect();
        let cluster_names: HashSet<&str> = self
            .kubernetes
            .clusters
            .iter()
            .map(|c| c.name.as_str())
            .collect();

        let mut vm_names = HashSet::new();
        for (i, vm) in self.vms.iter().enumerate() {
            if vm.name.is_empty() {
                errors.push(format!("vms[{}]: 'name' is required", i));
            } else if !vm_names.insert(vm.name.as_str()) {
                errors.push(format!("vms[{}] ({}): duplicate VM name", i, vm.name));
            } else if let Err(e) = naming::validate_vm_name(&vm.name) {
                errors.push(format!("vms[{}]: {}", i, e));
            }
            if vm.memory == 0 {
                errors.push(format!("vms[{}] ({}): 'memory' must be greater than 0", i, vm.name));
            }
            if vm.vcpus == 0 {
                errors.push(format!("vms[{}] ({}): 'vcpus' must be greater than 0", i, vm.name));
            }
            if vm.disk_size == 0 {
                errors.push(format!(
                    "vms[{}] ({}): 'disk_size' must be greater than 0",
                    i, vm.name
                ));
            }
            match (vm.vm_type, vm.host_ref()) {
                (VmType::Dpu, None) => errors.push(format!(
                    "vms[{}] ({}): 'host' is required for dpu type VMs",
                    i, vm.name
                )),
                (VmType::Dpu, Some(host)) if !host_names.contains(host) => {
                    errors.push(format!(
                        "vms[{}] ({}): 'host' references non-existent host '{}'",
                        i, vm.name, host
                    ))
                }
                _ => {}
            }
            match (&vm.k8s_cluster, &vm.k8s_role) {
                (Some(cluster), Some(_)) => {
                    if !cluster_names.contains(cluster.as_str()) {
                        errors.push(format!(
                            "vms[{}] ({}): 'k8s_cluster' references undefined cluster '{}'",
                            i, vm.name, cluster
                        ));
                    }
                }
                (Some(_), None) => errors.push(format!(
                    "vms[{}] ({}): 'k8s_role' is required when 'k8s_cluster' is set",
                    i, vm.name
                )),
                (None, Some(_)) => errors.push(format!(
                    "vms[{}] ({}): 'k8s_cluster' is required when 'k8s_role' is set",
                    i, vm.name
                )),
                (None, None) => {}
            }
        }

        if !self.vms.is_empty() {
            let os = &self.operating_system;
            if os.image_url.as_deref().unwrap_or("").is_empty()
                && os.image_ref.as_deref().unwrap_or("").is_empty()
            {
                errors.push(
                    "VMs are defined, operating_system: one of 'image_url' or 'image_ref' is required"
                        .to_string(),
                );
            }
            if os.image_name.is_empty() {
                errors.push(
                    "VMs are defined, operating_system: 'image_name' is required".to_string(),
                );
            }
        }

        if self.ssh.user.is_empty() {
            self.ssh.user = default_ssh_user();
        }
        if self.ssh.password.is_empty() {
            self.ssh.password = default_ssh_password();
        }
        if !self.ssh.key_path.as_os_str().is_empty() {
            match expand_tilde(&self.ssh.key_path) {
                Ok(p) => self.ssh.key_path = p,
                Err(e) => errors.push(format!("ssh.key_path: failed to expand path: {}", e)),
            }
        }

        if self.kubernetes.version.is_empty() {
            self.kubernetes.version = default_k8s_version();
        }
        if self.kubernetes.kubeconfig_dir.as_os_str().is_empty() {
            self.kubernetes.kubeconfig_dir = default_kubeconfig_dir();
        }
        for (i, cluster) in self.kubernetes.clusters.iter_mut().enumerate() {
            if cluster.name.is_empty() {
                errors.push(format!("kubernetes.clusters[{}]: 'name' is required", i));
            }
            if cluster.pod_cidr.is_empty() {
                cluster.pod_cidr = default_pod_cidr();
            }
            if cluster.service_cidr.is_empty() {
                cluster.service_cidr = default_service_cidr();
            }
            for (field, value) in [
                ("pod_cidr", &cluster.pod_cidr),
                ("service_cidr", &cluster.service_cidr),
            ] {
                if value.parse::<Ipv4Network>().is_err() {
                    errors.push(format!(
                        "kubernetes.clusters[{}] ({}): '{}' is not a valid CIDR: '{}'",
                        i, cluster.name, field, value
                    ));
                }
            }
        }

        if !errors.is_empty() {
            bail!("validation errors: {}", errors.join("; "));
        }
        Ok(())
    }

    pub fn network_by_type(&self, net_type: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.net_type == net_type)
    }

    pub fn network_by_name(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// The management network, required for IP discovery and SSH.
    pub fn mgmt_network(&self) -> Result<&NetworkConfig, ConfigRefError> {
        self.network_by_type(MGMT_NETWORK_TYPE)
            .ok_or_else(|| ConfigRefError::MissingNetworkType(MGMT_NETWORK_TYPE.to_string()))
    }

    /// The Kubernetes node network.
    pub fn k8s_network(&self) -> Result<&NetworkConfig, ConfigRefError> {
        self.network_by_type(K8S_NETWORK_TYPE)
            .ok_or_else(|| ConfigRefError::MissingNetworkType(K8S_NETWORK_TYPE.to_string()))
    }

    pub fn cluster(&self, name: &str) -> Result<&ClusterConfig, ConfigRefError> {
        self.kubernetes
            .clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ConfigRefError::UnknownCluster(name.to_string()))
    }

    pub fn vm(&self, name: &str) -> Result<&VmConfig, ConfigRefError> {
        self.vms
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| ConfigRefError::UnknownVm(name.to_string()))
    }

    /// Cluster names in declaration order.
    pub fn cluster_names(&self) -> Vec<&str> {
        self.kubernetes
            .clusters
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Expand a leading `~` to `$HOME`.
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(rest))
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
networks:
  - name: mgmt-net
    type: mgmt
    bridge_name: virbr-mgmt
    gateway: 192.168.120.1
    subnet_mask: 255.255.255.0
    dhcp_start: 192.168.120.10
    dhcp_end: 192.168.120.100
  - name: k8s-net
    type: k8s
    bridge_name: virbr-k8s
    gateway: 192.168.123.1
    subnet_mask: 255.255.255.0
    mode: l2-bridge
    use_ovs: true
    nic_model: igb
    attach_to: host
vms:
  - name: host1
    type: host
    k8s_cluster: c1
    k8s_role: master
    k8s_node_mac: "52:54:00:00:01:11"
    k8s_node_ip: 192.168.123.11
    memory: 4096
    vcpus: 4
    disk_size: 20
  - name: dpu1
    type: dpu
    host: host1
    k8s_cluster: c1
    k8s_role: worker
    memory: 2048
    vcpus: 2
    disk_size: 10
operating_system:
  image_url: https://example.com/fedora.qcow2
  image_name: fedora.qcow2
ssh:
  key_path: /root/.ssh/id_rsa
kubernetes:
  clusters:
    - name: c1
      cni: flannel
"#;
