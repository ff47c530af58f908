//! Whole-environment teardown.

use anyhow::Result;
use tracing::{info, instrument};

use dpusim_core::error::ErrorAccumulator;

use crate::k8s::kubeconfig;
use crate::network::NetworkProvisioner;
use crate::paths::RuntimePaths;
use crate::vm::VmProvisioner;

pub struct CleanupCoordinator<'a> {
    networks: &'a NetworkProvisioner<'a>,
    vms: &'a VmProvisioner<'a>,
    paths: &'a RuntimePaths,
}

impl<'a> CleanupCoordinator<'a> {
    pub fn new(
        networks: &'a NetworkProvisioner<'a>,
        vms: &'a VmProvisioner<'a>,
        paths: &'a RuntimePaths,
    ) -> Self {
        Self {
            networks,
            vms,
            paths,
        }
    }

    /// VMs first, then networks. Both always run; every failure ends up in
    /// one combined error.
    #[instrument(skip_all)]
    pub fn cleanup_all(&self) -> Result<()> {
        info!("cleaning up VMs and networks");
        let mut errors = ErrorAccumulator::new("cleanup errors");
        errors.record("VM cleanup", self.vms.cleanup_vms());
        errors.record("Network cleanup", self.networks.cleanup_networks());
        errors.finish()?;
        info!("cleanup complete");
        Ok(())
    }

    pub fn cleanup_kubeconfigs(&self) -> Result<()> {
        kubeconfig::cleanup_kubeconfigs(&self.paths.kubeconfig_dir)
    }
}
