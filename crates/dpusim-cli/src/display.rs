use serde::Serialize;
use tabled::Tabled;

use dpusim_core::config::{NetworkConfig, SimConfig};
use dpusim_core::topology::Topology;
use dpusim_runtime::k8s::ClusterOutcome;
use dpusim_runtime::vm::VmInfo;

/// Display row for `vm list` and `vm info`.
#[derive(Debug, Serialize, Tabled)]
pub struct VmRow {
    #[tabled(rename = "NAME")]
    pub name: String,
    #[tabled(rename = "STATE")]
    pub state: String,
    #[tabled(rename = "VCPUS")]
    pub vcpus: u32,
    #[tabled(rename = "MEM (MiB)")]
    pub memory_mib: u64,
    #[tabled(rename = "AUTOSTART")]
    pub autostart: bool,
    #[tabled(rename = "MGMT IP")]
    pub mgmt_ip: String,
}

impl From<&VmInfo> for VmRow {
    fn from(info: &VmInfo) -> Self {
        Self {
            name: info.name.clone(),
            state: info.state.to_string(),
            vcpus: info.vcpus,
            memory_mib: info.memory_mib,
            autostart: info.autostart,
            mgmt_ip: info.mgmt_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into()),
        }
    }
}

/// Display row for the networks half of `topology`.
#[derive(Debug, Serialize, Tabled)]
pub struct NetworkRow {
    #[tabled(rename = "NETWORK")]
    pub name: String,
    #[tabled(rename = "TYPE")]
    pub net_type: String,
    #[tabled(rename = "MODE")]
    pub mode: String,
    #[tabled(rename = "BRIDGE")]
    pub bridge: String,
    #[tabled(rename = "SUBNET")]
    pub subnet: String,
    #[tabled(rename = "ATTACH")]
    pub attach_to: String,
}

impl From<&NetworkConfig> for NetworkRow {
    fn from(net: &NetworkConfig) -> Self {
        let mode = if net.use_ovs {
            format!("{} (ovs)", net.mode)
        } else {
            net.mode.clone()
        };
        Self {
            name: net.name.clone(),
            net_type: net.net_type.clone(),
            mode,
            bridge: net.bridge_name.clone(),
            subnet: net
                .subnet_cidr()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
            attach_to: net.attach_to.clone(),
        }
    }
}

/// Display row for the VMs half of `topology`.
#[derive(Debug, Serialize, Tabled)]
pub struct TopologyVmRow {
    #[tabled(rename = "VM")]
    pub name: String,
    #[tabled(rename = "TYPE")]
    pub vm_type: String,
    #[tabled(rename = "HOST")]
    pub host: String,
    #[tabled(rename = "CLUSTER")]
    pub cluster: String,
    #[tabled(rename = "ROLE")]
    pub role: String,
    #[tabled(rename = "LINKS")]
    pub links: String,
}

pub fn topology_rows(config: &SimConfig, topology: &Topology) -> (Vec<NetworkRow>, Vec<TopologyVmRow>) {
    let mut networks: Vec<NetworkRow> = config.networks.iter().map(NetworkRow::from).collect();
    networks.extend(topology.links().map(|link| NetworkRow {
        name: link.network_name.clone(),
        net_type: "h2d".into(),
        mode: "l2-bridge (ovs)".into(),
        bridge: link.bridge_name.clone(),
        subnet: "-".into(),
        attach_to: format!("{},{}", link.host, link.dpu),
    }));

    let dash = || "-".to_string();
    let vms = config
        .vms
        .iter()
        .map(|vm| TopologyVmRow {
            name: vm.name.clone(),
            vm_type: vm.vm_type.to_string(),
            host: vm.host.clone().unwrap_or_else(dash),
            cluster: vm.k8s_cluster.clone().unwrap_or_else(dash),
            role: vm.k8s_role.clone().unwrap_or_else(dash),
            links: {
                let links: Vec<&str> = topology
                    .links_for(&vm.name)
                    .map(|l| l.network_name.as_str())
                    .collect();
                if links.is_empty() { dash() } else { links.join(",") }
            },
        })
        .collect();
    (networks, vms)
}

/// Display row for the clusters `deploy` bootstrapped.
#[derive(Debug, Serialize, Tabled)]
pub struct ClusterRow {
    #[tabled(rename = "CLUSTER")]
    pub cluster: String,
    #[tabled(rename = "PHASE")]
    pub phase: String,
    #[tabled(rename = "API SERVER")]
    pub api_server: String,
    #[tabled(rename = "KUBECONFIG")]
    pub kubeconfig: String,
}

impl From<&ClusterOutcome> for ClusterRow {
    fn from(o: &ClusterOutcome) -> Self {
        Self {
            cluster: o.cluster.clone(),
            phase: o.phase.to_string(),
            api_server: o.bootstrap.api_server_endpoint.clone(),
            kubeconfig: o.kubeconfig.display().to_string(),
        }
    }
}

/// Display row for `vm ip`.
#[derive(Debug, Serialize, Tabled)]
pub struct IpRow {
    #[tabled(rename = "VM")]
    pub vm: String,
    #[tabled(rename = "NETWORK")]
    pub network: String,
    #[tabled(rename = "IP")]
    pub ip: String,
}
