//! Libvirt network segments: declared NAT/bridge networks plus one
//! OVS-backed point link per host/DPU pair.

pub mod ovs;
pub mod xml;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};

use dpusim_core::config::{NetworkConfig, NetworkMode, SimConfig, VmConfig};
use dpusim_core::error::ErrorAccumulator;
use dpusim_core::topology::{HostDpuLink, Topology};

use crate::virt::VirtBackend;

pub struct NetworkProvisioner<'a> {
    virt: &'a dyn VirtBackend,
    config: &'a SimConfig,
    topology: &'a Topology,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(virt: &'a dyn VirtBackend, config: &'a SimConfig, topology: &'a Topology) -> Self {
        Self {
            virt,
            config,
            topology,
        }
    }

    /// Create a declared network. An existing network of the same name is
    /// left untouched.
    #[instrument(skip_all, fields(network = %net.name))]
    pub fn create_network(&self, net: &NetworkConfig) -> Result<()> {
        if self.virt.network_exists(&net.name)? {
            info!(network = %net.name, "network already exists, skipping creation");
            return Ok(());
        }

        let xml = match net.mode()? {
            NetworkMode::Nat => xml::nat(net, &self.reservations_for(net))?,
            NetworkMode::L2Bridge if net.use_ovs => {
                ovs::create_bridge(&net.bridge_name)?;
                xml::ovs_bridge(&net.name, &net.bridge_name)
            }
            NetworkMode::L2Bridge => xml::linux_bridge(&net.name, &net.bridge_name),
        };

        self.define_and_start(&net.name, &xml)?;
        info!(network = %net.name, mode = %net.mode, "created network");
        Ok(())
    }

    /// Create the OVS-backed link between a host and one of its DPUs.
    ///
    /// Links are created once per run, so an existing one is an error: it
    /// is left over from an unfinished run and needs a cleanup first.
    #[instrument(skip_all, fields(host, dpu))]
    pub fn create_host_to_dpu_network(&self, host: &str, dpu: &str) -> Result<()> {
        let link = HostDpuLink::new(host, dpu);
        if self.virt.network_exists(&link.network_name)? {
            bail!(
                "host-to-DPU network {} already exists; run cleanup first",
                link.network_name
            );
        }

        ovs::create_bridge(&link.bridge_name)
            .context("Failed to create OVS bridge for host-to-DPU link")?;
        self.define_and_start(
            &link.network_name,
            &xml::ovs_bridge(&link.network_name, &link.bridge_name),
        )?;
        info!(
            network = %link.network_name,
            bridge = %link.bridge_name,
            "created host-to-DPU network"
        );
        Ok(())
    }

    /// Every declared network, then every implicit host/DPU link. Stops at
    /// the first failure.
    #[instrument(skip_all)]
    pub fn create_all_networks(&self) -> Result<()> {
        for net in &self.config.networks {
            self.create_network(net)
                .with_context(|| format!("Failed to create network {}", net.name))?;
        }
        for link in self.topology.links() {
            self.create_host_to_dpu_network(&link.host, &link.dpu)
                .with_context(|| {
                    format!(
                        "Failed to create host-to-DPU network for host {} and DPU {}",
                        link.host, link.dpu
                    )
                })?;
        }
        info!("all networks created");
        Ok(())
    }

    /// Destroy (if active) and undefine a network. Missing is already clean.
    pub fn delete_network(&self, name: &str) -> Result<()> {
        if !self.virt.network_exists(name)? {
            debug!(network = name, "network does not exist, nothing to delete");
            return Ok(());
        }
        if self.virt.network_is_active(name)? {
            self.virt
                .destroy_network(name)
                .with_context(|| format!("Failed to destroy network {}", name))?;
        }
        self.virt
            .undefine_network(name)
            .with_context(|| format!("Failed to undefine network {}", name))?;
        Ok(())
    }

    /// Remove every declared network and link with its OVS bridge. Keeps
    /// going past failures and reports them all.
    #[instrument(skip_all)]
    pub fn cleanup_networks(&self) -> Result<()> {
        let mut errors = ErrorAccumulator::new("cleanup networks errors");

        for net in &self.config.networks {
            let removed = errors.record(
                &format!("failed to remove network {}", net.name),
                self.delete_network(&net.name),
            );
            if removed.is_none() {
                continue;
            }
            if net.use_ovs
                && errors
                    .record(
                        &format!("failed to remove OVS bridge {}", net.bridge_name),
                        ovs::delete_bridge(&net.bridge_name),
                    )
                    .is_none()
            {
                continue;
            }
            info!(network = %net.name, "removed network");
        }

        for link in self.topology.links() {
            let removed = errors.record(
                &format!("failed to remove network {}", link.network_name),
                self.delete_network(&link.network_name),
            );
            if removed.is_none() {
                continue;
            }
            if errors
                .record(
                    &format!("failed to remove OVS bridge {}", link.bridge_name),
                    ovs::delete_bridge(&link.bridge_name),
                )
                .is_some()
            {
                info!(
                    network = %link.network_name,
                    bridge = %link.bridge_name,
                    "removed host-to-DPU network"
                );
            }
        }

        errors.finish()
    }

    /// VMs with a pinned MAC whose node IP falls inside this network.
    fn reservations_for(&self, net: &NetworkConfig) -> Vec<&'a VmConfig> {
        let subnet = net.subnet_cidr();
        self.config
            .vms
            .iter()
            .filter(|vm| vm.k8s_node_mac.is_some())
            .filter(|vm| match (vm.k8s_node_ip, subnet) {
                (Some(ip), Some(cidr)) => cidr.contains(ip),
                _ => false,
            })
            .collect()
    }

    /// Define, mark autostart, and start. A network is never left defined
    /// but stopped by a successful call.
    fn define_and_start(&self, name: &str, xml: &str) -> Result<()> {
        self.virt
            .define_network(xml)
            .with_context(|| format!("Failed to define network {}", name))?;
        self.virt
            .set_network_autostart(name)
            .with_context(|| format!("Failed to set autostart for network {}", name))?;
        self.virt
            .start_network(name)
            .with_context(|| format!("Failed to start network {}", name))?;
        Ok(())
    }
}
