//! Hypervisor seam. Provisioners talk to libvirt only through [`VirtBackend`].

use std::fmt;
use std::net::Ipv4Addr;

use anyhow::Result;
use serde::Serialize;

mod virsh;

#[cfg(test)]
pub(crate) mod fake;

pub use virsh::VirshBackend;

/// Domain run state as libvirt reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    /// Whether libvirt counts the domain as active (has a running qemu).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DomainState::Running
                | DomainState::Blocked
                | DomainState::Paused
                | DomainState::Shutdown
                | DomainState::Suspended
        )
    }

    /// Parse `virsh domstate` / `dominfo` wording.
    pub fn from_virsh(s: &str) -> Self {
        match s.trim() {
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" => DomainState::Shutdown,
            "shut off" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One guest NIC with the IPv4 addresses its DHCP leases report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAddresses {
    pub name: String,
    pub mac: String,
    pub ipv4: Vec<Ipv4Addr>,
}

/// Resource summary for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainInfo {
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_kib: u64,
    pub autostart: bool,
}

/// Everything the provisioners need from the hypervisor.
///
/// Implementations own their connection; callers hold a shared reference
/// for the length of a run.
pub trait VirtBackend {
    // networks
    fn network_exists(&self, name: &str) -> Result<bool>;
    fn network_is_active(&self, name: &str) -> Result<bool>;
    fn define_network(&self, xml: &str) -> Result<()>;
    fn set_network_autostart(&self, name: &str) -> Result<()>;
    fn start_network(&self, name: &str) -> Result<()>;
    fn destroy_network(&self, name: &str) -> Result<()>;
    fn undefine_network(&self, name: &str) -> Result<()>;
    fn list_networks(&self) -> Result<Vec<String>>;

    // domains
    fn domain_exists(&self, name: &str) -> Result<bool>;
    fn domain_state(&self, name: &str) -> Result<DomainState>;
    fn domain_info(&self, name: &str) -> Result<DomainInfo>;
    fn define_domain(&self, xml: &str) -> Result<()>;
    fn set_domain_autostart(&self, name: &str, enabled: bool) -> Result<()>;
    fn start_domain(&self, name: &str) -> Result<()>;
    fn shutdown_domain(&self, name: &str) -> Result<()>;
    fn destroy_domain(&self, name: &str) -> Result<()>;
    fn reboot_domain(&self, name: &str) -> Result<()>;
    /// Undefine including managed-save, snapshot metadata and NVRAM.
    fn undefine_domain(&self, name: &str) -> Result<()>;
    fn list_domains(&self) -> Result<Vec<String>>;
    /// Addresses from the DHCP lease table.
    fn domain_addresses(&self, name: &str) -> Result<Vec<InterfaceAddresses>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parsing() {
        assert_eq!(DomainState::from_virsh("running\n"), DomainState::Running);
        assert_eq!(DomainState::from_virsh("shut off"), DomainState::Shutoff);
        assert_eq!(DomainState::from_virsh("in shutdown"), DomainState::Shutdown);
        assert_eq!(DomainState::from_virsh("idle"), DomainState::Blocked);
        assert_eq!(DomainState::from_virsh("weird"), DomainState::Unknown);
    }

    #[test]
    fn test_active_states() {
        assert!(DomainState::Running.is_active());
        assert!(DomainState::Paused.is_active());
        assert!(!DomainState::Shutoff.is_active());
        assert!(!DomainState::Crashed.is_active());
    }
}
