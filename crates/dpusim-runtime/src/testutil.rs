//! Shared fixtures for runtime tests.

use std::path::Path;

use dpusim_core::config::SimConfig;
use dpusim_core::topology::Topology;

use crate::paths::RuntimePaths;

/// One host with one DPU, a NAT mgmt network and an OVS k8s network
/// attached to hosts only, and one flannel cluster across both VMs.
pub const SAMPLE_CONFIG: &str = r#"
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

pub fn sample() -> (SimConfig, Topology) {
    parse(SAMPLE_CONFIG)
}

pub fn parse(yaml: &str) -> (SimConfig, Topology) {
    let cfg = SimConfig::parse(yaml).unwrap();
    let topo = Topology::resolve(&cfg);
    (cfg, topo)
}

/// Runtime dirs under `root` with the base image and an SSH key pair
/// already in place, so VM creation never reaches the network.
pub fn staged_paths(root: &Path, cfg: &mut SimConfig) -> RuntimePaths {
    let paths = RuntimePaths::under(root);
    std::fs::create_dir_all(&paths.image_dir).unwrap();
    std::fs::write(paths.base_image(&cfg.operating_system), b"base").unwrap();
    let key = root.join("id_rsa");
    std::fs::write(root.join("id_rsa.pub"), "ssh-ed25519 AAAA test\n").unwrap();
    cfg.ssh.key_path = key;
    paths
}

/// `ip -j addr show` from host1: mgmt on enp1s0, k8s on enp2s0.
pub const IP_ADDR_JSON: &str = r#"[
  {"ifindex":1,"ifname":"lo","operstate":"UNKNOWN","address":"00:00:00:00:00:00",
   "addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
  {"ifindex":2,"ifname":"enp1s0","operstate":"UP","address":"52:54:00:aa:bb:01",
   "addr_info":[{"family":"inet","local":"192.168.120.10","prefixlen":24},
                {"family":"inet6","local":"fe80::1","prefixlen":64}]},
  {"ifindex":3,"ifname":"enp2s0","operstate":"UP","address":"52:54:00:00:01:11",
   "addr_info":[{"family":"inet","local":"192.168.123.11","prefixlen":24}]},
  {"ifindex":4,"ifname":"enp3s0","operstate":"DOWN","address":"52:54:00:aa:bb:03"}
]"#;
