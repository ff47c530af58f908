//! In-memory [`VirtBackend`] for provisioner tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use anyhow::{Result, anyhow, bail};

use super::{DomainInfo, DomainState, InterfaceAddresses, VirtBackend};

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    pub xml: String,
    pub active: bool,
    pub autostart: bool,
}

#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub xml: String,
    pub state: DomainState,
    pub autostart: bool,
    pub addresses: Vec<InterfaceAddresses>,
}

#[derive(Default)]
pub struct FakeVirt {
    pub networks: RefCell<BTreeMap<String, FakeNetwork>>,
    pub domains: RefCell<BTreeMap<String, FakeDomain>>,
    /// Operation log, e.g. `define_network mgmt-net`, `start_domain host1`.
    pub calls: RefCell<Vec<String>>,
    /// Calls (`"<op> <name>"`) that fail instead of acting.
    pub failures: RefCell<HashSet<String>>,
    /// Leases handed to domains when they start, by domain name.
    pub leases: RefCell<BTreeMap<String, Vec<InterfaceAddresses>>>,
    /// Address queries per domain that still report nothing, as if the
    /// guest were booting.
    pub lease_delay: RefCell<BTreeMap<String, usize>>,
}

impl FakeVirt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str, name: &str) {
        self.failures.borrow_mut().insert(format!("{} {}", op, name));
    }

    pub fn set_lease(&self, domain: &str, ip: &str) {
        let addr = InterfaceAddresses {
            name: "vnet0".to_string(),
            mac: "52:54:00:00:00:01".to_string(),
            ipv4: vec![ip.parse::<Ipv4Addr>().unwrap()],
        };
        self.leases
            .borrow_mut()
            .entry(domain.to_string())
            .or_default()
            .push(addr.clone());
        if let Some(d) = self.domains.borrow_mut().get_mut(domain) {
            d.addresses.push(addr);
        }
    }

    /// The next `queries` address lookups for `domain` come back empty.
    pub fn delay_leases(&self, domain: &str, queries: usize) {
        self.lease_delay
            .borrow_mut()
            .insert(domain.to_string(), queries);
    }

    pub fn add_domain(&self, name: &str, state: DomainState) {
        self.domains.borrow_mut().insert(
            name.to_string(),
            FakeDomain {
                xml: format!("<domain><name>{}</name></domain>", name),
                state,
                autostart: false,
                addresses: Vec::new(),
            },
        );
    }

    pub fn add_network(&self, name: &str, active: bool) {
        self.networks.borrow_mut().insert(
            name.to_string(),
            FakeNetwork {
                xml: format!("<network><name>{}</name></network>", name),
                active,
                autostart: false,
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn network_xml(&self, name: &str) -> String {
        self.networks.borrow()[name].xml.clone()
    }

    pub fn domain_xml(&self, name: &str) -> String {
        self.domains.borrow()[name].xml.clone()
    }

    fn op(&self, op: &str, name: &str) -> Result<()> {
        let call = format!("{} {}", op, name);
        self.calls.borrow_mut().push(call.clone());
        if self.failures.borrow().contains(&call) {
            bail!("injected failure: {}", call);
        }
        Ok(())
    }

    fn with_domain<T>(&self, name: &str, f: impl FnOnce(&mut FakeDomain) -> Result<T>) -> Result<T> {
        let mut domains = self.domains.borrow_mut();
        let d = domains
            .get_mut(name)
            .ok_or_else(|| anyhow!("domain '{}' not found", name))?;
        f(d)
    }

    fn with_network<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeNetwork) -> Result<T>,
    ) -> Result<T> {
        let mut networks = self.networks.borrow_mut();
        let n = networks
            .get_mut(name)
            .ok_or_else(|| anyhow!("network '{}' not found", name))?;
        f(n)
    }
}

/// First `<name>` element of a libvirt XML document.
pub fn xml_name(xml: &str) -> Option<String> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")? + start;
    Some(xml[start..end].to_string())
}

impl VirtBackend for FakeVirt {
    fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.networks.borrow().contains_key(name))
    }

    fn network_is_active(&self, name: &str) -> Result<bool> {
        Ok(self.networks.borrow().get(name).is_some_and(|n| n.active))
    }

    fn define_network(&self, xml: &str) -> Result<()> {
        let name = xml_name(xml).ok_or_else(|| anyhow!("network XML has no name"))?;
        self.op("define_network", &name)?;
        if self.networks.borrow().contains_key(&name) {
            bail!("network '{}' already exists", name);
        }
        self.networks.borrow_mut().insert(
            name,
            FakeNetwork {
                xml: xml.to_string(),
                active: false,
                autostart: false,
            },
        );
        Ok(())
    }

    fn set_network_autostart(&self, name: &str) -> Result<()> {
        self.op("set_network_autostart", name)?;
        self.with_network(name, |n| {
            n.autostart = true;
            Ok(())
        })
    }

    fn start_network(&self, name: &str) -> Result<()> {
        self.op("start_network", name)?;
        self.with_network(name, |n| {
            if n.active {
                bail!("network '{}' is already active", name);
            }
            n.active = true;
            Ok(())
        })
    }

    fn destroy_network(&self, name: &str) -> Result<()> {
        self.op("destroy_network", name)?;
        self.with_network(name, |n| {
            if !n.active {
                bail!("network '{}' is not active", name);
            }
            n.active = false;
            Ok(())
        })
    }

    fn undefine_network(&self, name: &str) -> Result<()> {
        self.op("undefine_network", name)?;
        self.networks
            .borrow_mut()
            .remove(name)
            .map(drop)
            .ok_or_else(|| anyhow!("network '{}' not found", name))
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.networks.borrow().keys().cloned().collect())
    }

    fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.domains.borrow().contains_key(name))
    }

    fn domain_state(&self, name: &str) -> Result<DomainState> {
        self.with_domain(name, |d| Ok(d.state))
    }

    fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        self.with_domain(name, |d| {
            Ok(DomainInfo {
                state: d.state,
                vcpus: 2,
                memory_kib: 2048 * 1024,
                autostart: d.autostart,
            })
        })
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        let name = xml_name(xml).ok_or_else(|| anyhow!("domain XML has no name"))?;
        self.op("define_domain", &name)?;
        if self.domains.borrow().contains_key(&name) {
            bail!("domain '{}' already exists", name);
        }
        self.domains.borrow_mut().insert(
            name,
            FakeDomain {
                xml: xml.to_string(),
                state: DomainState::Shutoff,
                autostart: false,
                addresses: Vec::new(),
            },
        );
        Ok(())
    }

    fn set_domain_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.op("set_domain_autostart", name)?;
        self.with_domain(name, |d| {
            d.autostart = enabled;
            Ok(())
        })
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.op("start_domain", name)?;
        let leases = self.leases.borrow().get(name).cloned().unwrap_or_default();
        self.with_domain(name, |d| {
            d.state = DomainState::Running;
            d.addresses = leases;
            Ok(())
        })
    }

    fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.op("shutdown_domain", name)?;
        self.with_domain(name, |d| {
            d.state = DomainState::Shutoff;
            Ok(())
        })
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        self.op("destroy_domain", name)?;
        self.with_domain(name, |d| {
            d.state = DomainState::Shutoff;
            Ok(())
        })
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        self.op("reboot_domain", name)?;
        self.with_domain(name, |_| Ok(()))
    }

    fn undefine_domain(&self, name: &str) -> Result<()> {
        self.op("undefine_domain", name)?;
        self.domains
            .borrow_mut()
            .remove(name)
            .map(drop)
            .ok_or_else(|| anyhow!("domain '{}' not found", name))
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.domains.borrow().keys().cloned().collect())
    }

    fn domain_addresses(&self, name: &str) -> Result<Vec<InterfaceAddresses>> {
        if let Some(left) = self.lease_delay.borrow_mut().get_mut(name) {
            if *left > 0 {
                *left -= 1;
                return Ok(Vec::new());
            }
        }
        self.with_domain(name, |d| Ok(d.addresses.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_name() {
        assert_eq!(
            xml_name("<domain type='kvm'>\n  <name>host1</name>").as_deref(),
            Some("host1")
        );
        assert_eq!(xml_name("<network/>"), None);
    }

    #[test]
    fn test_injected_failure_is_logged() {
        let fake = FakeVirt::new();
        fake.add_network("n1", true);
        fake.fail_on("destroy_network", "n1");
        assert!(fake.destroy_network("n1").is_err());
        assert!(fake.network_is_active("n1").unwrap());
        assert_eq!(fake.calls(), vec!["destroy_network n1"]);
    }
}
