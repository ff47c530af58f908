//! VM creation, lifecycle and teardown on top of [`VirtBackend`].

pub mod arch;
pub mod cloud_init;
pub mod domain;
pub mod image;

use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{debug, info, instrument};

use dpusim_core::config::{MGMT_NETWORK_TYPE, SimConfig, VmConfig};
use dpusim_core::error::{ConfigRefError, ErrorAccumulator};
use dpusim_core::platform::Arch;
use dpusim_core::poll::{PollPolicy, poll_until};
use dpusim_core::topology::Topology;

use crate::paths::RuntimePaths;
use crate::remote::RemoteShell;
use crate::virt::{DomainState, VirtBackend};

use self::arch::ArchSpec;
use self::domain::DomainSpec;

/// Point-in-time view of one VM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmInfo {
    pub name: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub autostart: bool,
    pub mgmt_ip: Option<Ipv4Addr>,
}

pub struct VmProvisioner<'a> {
    virt: &'a dyn VirtBackend,
    config: &'a SimConfig,
    topology: &'a Topology,
    paths: &'a RuntimePaths,
    arch: Arch,
    ip_policy: PollPolicy,
    boot_policy: PollPolicy,
}

impl<'a> VmProvisioner<'a> {
    pub fn new(
        virt: &'a dyn VirtBackend,
        config: &'a SimConfig,
        topology: &'a Topology,
        paths: &'a RuntimePaths,
        arch: Arch,
    ) -> Self {
        Self {
            virt,
            config,
            topology,
            paths,
            arch,
            ip_policy: PollPolicy::ip_lookup(),
            boot_policy: PollPolicy::vm_boot(),
        }
    }

    /// Override the lease polling used by [`Self::wait_for_ip`].
    pub fn with_ip_policy(mut self, policy: PollPolicy) -> Self {
        self.ip_policy = policy;
        self
    }

    /// Override the lease polling used by [`Self::wait_for_boot`].
    pub fn with_boot_policy(mut self, policy: PollPolicy) -> Self {
        self.boot_policy = policy;
        self
    }

    pub fn boot_policy(&self) -> PollPolicy {
        self.boot_policy
    }

    /// Create, define, autostart and start one VM.
    ///
    /// Fails if a domain with the name already exists; the existing domain
    /// is not touched. Images on disk from an earlier attempt are reused.
    #[instrument(skip_all, fields(vm = %vm.name))]
    pub fn create_vm(&self, vm: &VmConfig) -> Result<()> {
        if self.virt.domain_exists(&vm.name)? {
            bail!("VM {} already exists", vm.name);
        }
        info!(vm = %vm.name, vm_type = %vm.vm_type, "creating VM");

        let base = self.paths.base_image(&self.config.operating_system);
        image::ensure_cloud_image(&self.config.operating_system, &base)
            .context("Failed to prepare cloud image")?;

        let disk = self.paths.disk(&vm.name);
        image::create_vm_disk(&disk, vm.disk_size, &base)
            .context("Failed to create VM disk")?;

        let seed = cloud_init::create_cloud_init_iso(&self.paths.image_dir, &vm.name, &self.config.ssh)
            .context("Failed to create cloud-init ISO")?;

        let spec = self.arch_spec()?;
        let nvram = match &spec.firmware {
            Some(fw) => Some(
                arch::ensure_uefi_nvram(&self.paths.nvram_dir, &vm.name, &fw.vars_template)
                    .context("Failed to prepare UEFI NVRAM")?,
            ),
            None => None,
        };

        let xml = domain::domain_xml(
            &DomainSpec {
                vm,
                arch: &spec,
                disk: &disk,
                seed: &seed,
                nvram: nvram.as_deref(),
            },
            &domain::interfaces(self.config, self.topology, vm),
        );

        self.virt
            .define_domain(&xml)
            .context("Failed to define domain")?;
        self.virt
            .set_domain_autostart(&vm.name, true)
            .context("Failed to set autostart")?;
        self.virt
            .start_domain(&vm.name)
            .context("Failed to start VM")?;

        info!(vm = %vm.name, "created and started VM");
        Ok(())
    }

    /// Every configured VM in order. Stops at the first failure.
    #[instrument(skip_all)]
    pub fn create_all_vms(&self) -> Result<()> {
        for vm in &self.config.vms {
            self.create_vm(vm)
                .with_context(|| format!("Failed to create VM {}", vm.name))?;
        }
        info!(count = self.config.vms.len(), "all VMs created");
        Ok(())
    }

    fn arch_spec(&self) -> Result<ArchSpec> {
        arch::host_arch_spec(self.arch).context("Failed to resolve libvirt arch spec")
    }

    fn is_active(&self, name: &str) -> Result<bool> {
        Ok(self
            .virt
            .domain_state(name)
            .with_context(|| format!("Failed to look up VM {}", name))?
            .is_active())
    }

    pub fn start_vm(&self, name: &str) -> Result<()> {
        if self.is_active(name)? {
            bail!("VM {} is already running", name);
        }
        self.virt
            .start_domain(name)
            .with_context(|| format!("Failed to start VM {}", name))
    }

    /// Graceful ACPI shutdown.
    pub fn stop_vm(&self, name: &str) -> Result<()> {
        if !self.is_active(name)? {
            bail!("VM {} is already stopped", name);
        }
        self.virt
            .shutdown_domain(name)
            .with_context(|| format!("Failed to shut down VM {}", name))
    }

    /// Hard power-off.
    pub fn destroy_vm(&self, name: &str) -> Result<()> {
        if !self.is_active(name)? {
            bail!("VM {} is not running", name);
        }
        self.virt
            .destroy_domain(name)
            .with_context(|| format!("Failed to destroy VM {}", name))
    }

    pub fn reboot_vm(&self, name: &str) -> Result<()> {
        if !self.is_active(name)? {
            bail!("VM {} is not running", name);
        }
        self.virt
            .reboot_domain(name)
            .with_context(|| format!("Failed to reboot VM {}", name))
    }

    pub fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.virt
            .set_domain_autostart(name, enabled)
            .with_context(|| format!("Failed to set autostart for VM {}", name))
    }

    /// Power off, undefine, and remove disk, seed and NVRAM files.
    ///
    /// A VM that does not exist only has its files removed. Every step runs
    /// even if an earlier one failed.
    #[instrument(skip_all, fields(vm = name))]
    pub fn delete_vm(&self, name: &str) -> Result<()> {
        let mut errors = ErrorAccumulator::new(format!("delete VM {} errors", name));

        let exists = errors
            .record("failed to look up domain", self.virt.domain_exists(name))
            .unwrap_or(false);
        if exists {
            let active = errors
                .record("failed to read domain state", self.virt.domain_state(name))
                .is_some_and(DomainState::is_active);
            if active {
                errors.record(
                    "failed to destroy VM before deletion",
                    self.virt.destroy_domain(name),
                );
            }
            errors.record("failed to undefine VM", self.virt.undefine_domain(name));
        } else {
            debug!(vm = name, "domain does not exist, cleaning files only");
        }

        errors.record(
            "failed to delete VM disk",
            image::remove_if_exists(&self.paths.disk(name)),
        );
        errors.record(
            "failed to delete cloud-init ISO",
            image::remove_if_exists(&self.paths.cloud_init(name)),
        );
        errors.record(
            "failed to delete UEFI NVRAM",
            arch::delete_uefi_nvram(&self.paths.nvram_dir, name),
        );

        errors.finish()
    }

    /// [`Self::delete_vm`] for every configured VM, aggregating failures.
    #[instrument(skip_all)]
    pub fn cleanup_vms(&self) -> Result<()> {
        let mut errors = ErrorAccumulator::new("cleanup VMs errors");
        for vm in &self.config.vms {
            if errors
                .record(&format!("failed to remove VM {}", vm.name), self.delete_vm(&vm.name))
                .is_some()
            {
                info!(vm = %vm.name, "cleaned up VM");
            }
        }
        errors.finish()
    }

    pub fn list_vms(&self) -> Result<Vec<String>> {
        self.virt.list_domains().context("Failed to list domains")
    }

    pub fn vm_state(&self, name: &str) -> Result<DomainState> {
        self.virt
            .domain_state(name)
            .with_context(|| format!("Failed to get state for {}", name))
    }

    /// State and resources, plus the management IP if a lease exists.
    pub fn vm_info(&self, name: &str) -> Result<VmInfo> {
        let info = self
            .virt
            .domain_info(name)
            .with_context(|| format!("Failed to get domain info for {}", name))?;
        Ok(VmInfo {
            name: name.to_string(),
            state: info.state,
            vcpus: info.vcpus,
            memory_mib: info.memory_kib / 1024,
            autostart: info.autostart,
            mgmt_ip: self.get_ip(name, MGMT_NETWORK_TYPE).ok(),
        })
    }

    /// Current lease address of `vm` inside the subnet of the network with
    /// type `net_type`.
    pub fn get_ip(&self, vm: &str, net_type: &str) -> Result<Ipv4Addr> {
        let net = self
            .config
            .network_by_type(net_type)
            .ok_or_else(|| ConfigRefError::MissingNetworkType(net_type.to_string()))?;
        let Some(subnet) = net.subnet_cidr() else {
            bail!("could not determine subnet for network type '{}'", net_type);
        };

        let addrs = self
            .virt
            .domain_addresses(vm)
            .with_context(|| format!("Failed to get interfaces for {}", vm))?;
        addrs
            .iter()
            .flat_map(|iface| iface.ipv4.iter().copied())
            .find(|ip| subnet.contains(*ip))
            .ok_or_else(|| anyhow::anyhow!("no IP address found for VM {} in subnet {}", vm, subnet))
    }

    /// Poll [`Self::get_ip`] until a lease shows up or the deadline passes.
    pub fn wait_for_ip(&self, vm: &str, net_type: &str) -> Result<Ipv4Addr> {
        self.poll_ip(vm, net_type, self.ip_policy)
    }

    /// Management lease of a VM that may still be booting.
    pub fn wait_for_boot(&self, vm: &str) -> Result<Ipv4Addr> {
        self.poll_ip(vm, MGMT_NETWORK_TYPE, self.boot_policy)
    }

    /// Wait, in config order, for every VM to take a management lease and
    /// then answer over SSH.
    #[instrument(skip_all)]
    pub fn wait_for_all_vms(
        &self,
        shell: &dyn RemoteShell,
        ssh_policy: PollPolicy,
    ) -> Result<Vec<(String, Ipv4Addr)>> {
        let mut ready = Vec::with_capacity(self.config.vms.len());
        for vm in &self.config.vms {
            let ip = self
                .wait_for_boot(&vm.name)
                .with_context(|| format!("Failed to get IP for {}", vm.name))?;
            info!(vm = %vm.name, %ip, "VM has a management IP");
            shell
                .wait_until_ready(ip, ssh_policy)
                .with_context(|| format!("Failed to connect to SSH on {}", vm.name))?;
            ready.push((vm.name.clone(), ip));
        }
        Ok(ready)
    }

    fn poll_ip(&self, vm: &str, net_type: &str, policy: PollPolicy) -> Result<Ipv4Addr> {
        if self
            .config
            .network_by_type(net_type)
            .and_then(|n| n.subnet_cidr())
            .is_none()
        {
            // Fail on config problems right away instead of polling them.
            self.get_ip(vm, net_type)?;
        }
        poll_until(
            policy,
            &format!("IP address for VM {} on network {}", vm, net_type),
            || self.get_ip(vm, net_type).map(Some),
        )
    }

    /// Management IP, used to reach the VM over SSH.
    pub fn mgmt_ip(&self, vm: &str) -> Result<Ipv4Addr> {
        self.wait_for_ip(vm, MGMT_NETWORK_TYPE)
    }
}
