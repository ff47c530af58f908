//! Per-cluster bootstrap: guest bridge prerequisite, first master init,
//! kubeconfig, CNI, then the remaining masters and the workers.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use dpusim_core::config::{ClusterConfig, K8S_NETWORK_TYPE, SimConfig, VmConfig};
use dpusim_core::error::ConfigRefError;
use dpusim_core::poll::PollPolicy;
use dpusim_core::topology::Topology;

use super::cni::{CniInstaller, CniTarget, ensure_supported, requires_guest_bridge};
use super::guest_bridge::setup_br_ex;
use super::kubeadm::{self, ClusterBootstrapResult};
use super::kubeconfig::save_kubeconfig;
use super::node_prep::prepare_node;
use crate::paths::RuntimePaths;
use crate::remote::RemoteShell;
use crate::vm::VmProvisioner;

/// How far a cluster got. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapPhase {
    Unbootstrapped,
    ControlPlaneInitialized,
    CniInstalled,
    ControlPlaneJoined,
    WorkersJoined,
    Ready,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapPhase::Unbootstrapped => "unbootstrapped",
            BootstrapPhase::ControlPlaneInitialized => "control-plane-initialized",
            BootstrapPhase::CniInstalled => "cni-installed",
            BootstrapPhase::ControlPlaneJoined => "control-plane-joined",
            BootstrapPhase::WorkersJoined => "workers-joined",
            BootstrapPhase::Ready => "ready",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOutcome {
    pub cluster: String,
    pub phase: BootstrapPhase,
    pub kubeconfig: PathBuf,
    pub bootstrap: ClusterBootstrapResult,
}

/// Members of one cluster split by role, each in config order.
struct Members<'c> {
    masters: Vec<&'c VmConfig>,
    workers: Vec<&'c VmConfig>,
}

pub struct ClusterBootstrapper<'a> {
    vms: &'a VmProvisioner<'a>,
    shell: &'a dyn RemoteShell,
    cni: &'a dyn CniInstaller,
    config: &'a SimConfig,
    topology: &'a Topology,
    paths: &'a RuntimePaths,
    ssh_policy: PollPolicy,
}

impl<'a> ClusterBootstrapper<'a> {
    pub fn new(
        vms: &'a VmProvisioner<'a>,
        shell: &'a dyn RemoteShell,
        cni: &'a dyn CniInstaller,
        config: &'a SimConfig,
        topology: &'a Topology,
        paths: &'a RuntimePaths,
    ) -> Self {
        Self {
            vms,
            shell,
            cni,
            config,
            topology,
            paths,
            ssh_policy: PollPolicy::ssh_ready(),
        }
    }

    pub fn with_ssh_policy(mut self, policy: PollPolicy) -> Self {
        self.ssh_policy = policy;
        self
    }

    /// Install the container runtime and Kubernetes packages on every VM
    /// that belongs to a cluster, in config order. VMs may still be booting,
    /// so the lease wait uses the provisioner's boot policy.
    #[instrument(skip_all)]
    pub fn prepare_nodes(&self) -> Result<()> {
        let version = &self.config.kubernetes.version;
        for vm in self.config.vms.iter().filter(|vm| vm.k8s_cluster.is_some()) {
            let ip = self
                .vms
                .wait_for_boot(&vm.name)
                .with_context(|| format!("Failed to get IP for {}", vm.name))?;
            prepare_node(self.shell, &vm.name, ip, version, self.ssh_policy)
                .with_context(|| format!("Failed to prepare node {}", vm.name))?;
        }
        Ok(())
    }

    /// Bootstrap every cluster one at a time, in config order. Stops at the
    /// first cluster that fails.
    pub fn setup_all_clusters(&self) -> Result<Vec<ClusterOutcome>> {
        let mut outcomes = Vec::new();
        for name in self.config.cluster_names() {
            outcomes.push(self.setup_cluster(name)?);
        }
        Ok(outcomes)
    }

    #[instrument(skip_all, fields(cluster = name))]
    pub fn setup_cluster(&self, name: &str) -> Result<ClusterOutcome> {
        let cluster = self.config.cluster(name)?;
        ensure_supported(cluster.cni)?;
        let members = self.members(name);
        let Some(first) = members.masters.first().copied() else {
            return Err(ConfigRefError::NoMaster(name.to_string()).into());
        };

        let mut phase = BootstrapPhase::Unbootstrapped;
        info!(cluster = name, cni = %cluster.cni, %phase, "bootstrapping cluster");

        if requires_guest_bridge(cluster.cni) {
            for vm in members.masters.iter().chain(&members.workers) {
                self.setup_guest_bridge(vm).with_context(|| {
                    format!("cluster {}: failed to set up br-ex on {}", name, vm.name)
                })?;
            }
        }

        let (bootstrap, api_ip) = self
            .init_first_master(first, cluster)
            .with_context(|| format!("cluster {}: failed to initialize {}", name, first.name))?;
        phase = self.advance(name, phase, BootstrapPhase::ControlPlaneInitialized);

        let kubeconfig = save_kubeconfig(self.paths, name, &bootstrap.kubeconfig)
            .with_context(|| format!("cluster {}: failed to save kubeconfig", name))?;

        let master_names: Vec<&str> = members.masters.iter().map(|vm| vm.name.as_str()).collect();
        self.cni
            .install(&CniTarget {
                cluster,
                kubeconfig: &kubeconfig,
                api_ip,
                masters: &master_names,
            })
            .with_context(|| format!("cluster {}: failed to install {}", name, cluster.cni))?;
        phase = self.advance(name, phase, BootstrapPhase::CniInstalled);

        for vm in &members.masters[1..] {
            self.vms
                .mgmt_ip(&vm.name)
                .and_then(|ip| kubeadm::join_control_plane(self.shell, &vm.name, ip, &bootstrap))
                .with_context(|| format!("cluster {}: failed to join {}", name, vm.name))?;
        }
        phase = self.advance(name, phase, BootstrapPhase::ControlPlaneJoined);

        for vm in &members.workers {
            self.vms
                .mgmt_ip(&vm.name)
                .and_then(|ip| kubeadm::join_worker(self.shell, &vm.name, ip, &bootstrap))
                .with_context(|| format!("cluster {}: failed to join {}", name, vm.name))?;
        }
        phase = self.advance(name, phase, BootstrapPhase::WorkersJoined);
        phase = self.advance(name, phase, BootstrapPhase::Ready);

        Ok(ClusterOutcome {
            cluster: name.to_string(),
            phase,
            kubeconfig,
            bootstrap,
        })
    }

    fn members(&self, name: &str) -> Members<'_> {
        let mut members = Members {
            masters: Vec::new(),
            workers: Vec::new(),
        };
        let Some(roles) = self.topology.cluster(name) else {
            return members;
        };
        for (role, vms) in roles {
            if role.is_master() {
                members.masters.extend(vms);
            } else if role.is_worker() {
                members.workers.extend(vms);
            } else {
                let names: Vec<&str> = vms.iter().map(|vm| vm.name.as_str()).collect();
                warn!(cluster = name, %role, vms = ?names, "ignoring VMs with unknown role");
            }
        }
        members
    }

    fn setup_guest_bridge(&self, vm: &VmConfig) -> Result<()> {
        let mgmt = self.vms.mgmt_ip(&vm.name)?;
        let k8s = self.k8s_ip(vm)?;
        setup_br_ex(self.shell, &vm.name, mgmt, k8s)
    }

    fn init_first_master(
        &self,
        vm: &VmConfig,
        cluster: &ClusterConfig,
    ) -> Result<(ClusterBootstrapResult, Ipv4Addr)> {
        let mgmt = self.vms.mgmt_ip(&vm.name)?;
        self.shell.wait_until_ready(mgmt, self.ssh_policy)?;
        let k8s = self.k8s_ip(vm)?;
        let result = kubeadm::initialize_control_plane(self.shell, &vm.name, mgmt, k8s, cluster)?;
        Ok((result, k8s))
    }

    /// Lease on the k8s network, or the configured `k8s_node_ip` when no
    /// lease shows up in time.
    fn k8s_ip(&self, vm: &VmConfig) -> Result<Ipv4Addr> {
        match self.vms.wait_for_ip(&vm.name, K8S_NETWORK_TYPE) {
            Ok(ip) => Ok(ip),
            Err(e) => match vm.k8s_node_ip {
                Some(ip) => {
                    warn!(vm = %vm.name, %ip, error = %format!("{:#}", e), "using configured k8s IP");
                    Ok(ip)
                }
                None => Err(e).with_context(|| format!("no Kubernetes IP for VM {}", vm.name)),
            },
        }
    }

    fn advance(&self, cluster: &str, from: BootstrapPhase, to: BootstrapPhase) -> BootstrapPhase {
        debug_assert!(to > from);
        info!(cluster, %from, %to, "bootstrap phase");
        to
    }
}
