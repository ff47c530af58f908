//! Pure derivations over a [`SimConfig`]: which DPU plugs into which host,
//! and how VMs group into clusters by role.
//!
//! Computed once per run and then only read.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::{SimConfig, VmConfig, VmType};
use crate::naming;

/// Point-to-point link between a host VM and one of its DPUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostDpuLink {
    pub host: String,
    pub dpu: String,
    /// Libvirt network name, `h2d-{host}-{dpu}`.
    pub network_name: String,
    /// OVS bridge backing the network.
    pub bridge_name: String,
}

impl HostDpuLink {
    pub fn new(host: &str, dpu: &str) -> Self {
        Self {
            host: host.to_string(),
            dpu: dpu.to_string(),
            network_name: naming::h2d_network_name(host, dpu),
            bridge_name: naming::h2d_bridge_name(host, dpu),
        }
    }

    /// Whether `vm` is either end of this link.
    pub fn involves(&self, vm: &str) -> bool {
        self.host == vm || self.dpu == vm
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DpuConnection {
    pub dpu: VmConfig,
    pub link: HostDpuLink,
}

/// A host and every DPU attached to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostDpuMapping {
    pub host: VmConfig,
    pub connections: Vec<DpuConnection>,
}

/// Kubernetes role label. Open-ended: values besides `master`/`worker`
/// are kept in their own bucket rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ClusterRole(String);

impl ClusterRole {
    pub const MASTER: &'static str = "master";
    pub const WORKER: &'static str = "worker";

    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    pub fn master() -> Self {
        Self::new(Self::MASTER)
    }

    pub fn worker() -> Self {
        Self::new(Self::WORKER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_master(&self) -> bool {
        self.0 == Self::MASTER
    }

    pub fn is_worker(&self) -> bool {
        self.0 == Self::WORKER
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role → members, members in config order.
pub type ClusterRoleMapping = BTreeMap<ClusterRole, Vec<VmConfig>>;

/// One mapping per host that has at least one DPU, hosts in config order,
/// each host's DPUs in config order. DPUs naming no existing host are skipped.
pub fn resolve_host_dpu_mappings(config: &SimConfig) -> Vec<HostDpuMapping> {
    config
        .vms
        .iter()
        .filter(|vm| vm.vm_type == VmType::Host)
        .filter_map(|host| {
            let connections: Vec<DpuConnection> = config
                .vms
                .iter()
                .filter(|vm| vm.is_dpu() && vm.host_ref() == Some(host.name.as_str()))
                .map(|dpu| DpuConnection {
                    dpu: dpu.clone(),
                    link: HostDpuLink::new(&host.name, &dpu.name),
                })
                .collect();
            (!connections.is_empty()).then(|| HostDpuMapping {
                host: host.clone(),
                connections,
            })
        })
        .collect()
}

/// Cluster name → role → members, for every VM that names a cluster.
pub fn resolve_cluster_role_mapping(config: &SimConfig) -> BTreeMap<String, ClusterRoleMapping> {
    let mut result: BTreeMap<String, ClusterRoleMapping> = BTreeMap::new();
    for vm in &config.vms {
        let (Some(cluster), Some(role)) = (&vm.k8s_cluster, &vm.k8s_role) else {
            continue;
        };
        result
            .entry(cluster.clone())
            .or_default()
            .entry(ClusterRole::new(role.as_str()))
            .or_default()
            .push(vm.clone());
    }
    result
}

/// Both derivations, resolved once and shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Topology {
    host_dpu: Vec<HostDpuMapping>,
    clusters: BTreeMap<String, ClusterRoleMapping>,
}

impl Topology {
    pub fn resolve(config: &SimConfig) -> Self {
        Self {
            host_dpu: resolve_host_dpu_mappings(config),
            clusters: resolve_cluster_role_mapping(config),
        }
    }

    pub fn host_dpu_mappings(&self) -> &[HostDpuMapping] {
        &self.host_dpu
    }

    pub fn cluster_roles(&self) -> &BTreeMap<String, ClusterRoleMapping> {
        &self.clusters
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterRoleMapping> {
        self.clusters.get(name)
    }

    /// Every host-to-DPU link in mapping order.
    pub fn links(&self) -> impl Iterator<Item = &HostDpuLink> {
        self.host_dpu
            .iter()
            .flat_map(|m| m.connections.iter().map(|c| &c.link))
    }

    /// Links with `vm` at either end.
    pub fn links_for(&self, vm: &str) -> impl Iterator<Item = &HostDpuLink> {
        self.links().filter(move |l| l.involves(vm))
    }
}
