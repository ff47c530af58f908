//! One provisioning run: the config, its topology, and the libvirt
//! connection every provisioner borrows.

use anyhow::Result;
use tracing::info;

use dpusim_core::config::{LIBVIRT_URI, SimConfig};
use dpusim_core::platform::{Arch, host_arch};
use dpusim_core::topology::Topology;

use crate::network::NetworkProvisioner;
use crate::paths::RuntimePaths;
use crate::remote::SshShell;
use crate::virt::{VirshBackend, VirtBackend};
use crate::vm::VmProvisioner;

/// Owns the virtualization backend for the length of a run. The connection
/// is released when the session drops.
pub struct Session<B: VirtBackend = VirshBackend> {
    backend: B,
    config: SimConfig,
    topology: Topology,
    paths: RuntimePaths,
    arch: Arch,
    ssh: SshShell,
}

impl Session<VirshBackend> {
    /// Connect to the system libvirt daemon and resolve the topology.
    pub fn open(config: SimConfig) -> Result<Self> {
        let backend = VirshBackend::open(LIBVIRT_URI)?;
        let arch = host_arch()?;
        let paths = RuntimePaths::system(&config);
        info!(%arch, vms = config.vms.len(), networks = config.networks.len(), "session opened");
        Ok(Self::from_parts(backend, config, paths, arch))
    }
}

impl<B: VirtBackend> Session<B> {
    pub fn from_parts(backend: B, config: SimConfig, paths: RuntimePaths, arch: Arch) -> Self {
        let topology = Topology::resolve(&config);
        let ssh = SshShell::new(&config.ssh);
        Self {
            backend,
            config,
            topology,
            paths,
            arch,
            ssh,
        }
    }

    pub fn networks(&self) -> NetworkProvisioner<'_> {
        NetworkProvisioner::new(&self.backend, &self.config, &self.topology)
    }

    pub fn vms(&self) -> VmProvisioner<'_> {
        VmProvisioner::new(&self.backend, &self.config, &self.topology, &self.paths, self.arch)
    }

    pub fn ssh(&self) -> &SshShell {
        &self.ssh
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupCoordinator;
    use crate::shell_mock;
    use crate::testutil::{sample, staged_paths};
    use crate::virt::fake::FakeVirt;

    #[test]
    fn test_session_drives_full_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cfg, _) = sample();
        let paths = staged_paths(dir.path(), &mut cfg);
        let (_guard, _calls) = shell_mock::mock_host().install();
        let session = Session::from_parts(FakeVirt::new(), cfg, paths, Arch::X86_64);

        session.networks().create_all_networks().unwrap();
        session.vms().create_all_vms().unwrap();
        let net_defs: Vec<String> = session
            .backend()
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("define_network"))
            .collect();
        assert_eq!(net_defs.last().unwrap(), "define_network h2d-host1-dpu1");
        assert_eq!(session.vms().list_vms().unwrap(), vec!["dpu1", "host1"]);

        let networks = session.networks();
        let vms = session.vms();
        CleanupCoordinator::new(&networks, &vms, session.paths())
            .cleanup_all()
            .unwrap();
        assert!(session.vms().list_vms().unwrap().is_empty());
    }
}
