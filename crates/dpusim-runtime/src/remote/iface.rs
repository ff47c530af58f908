//! Guest interface lookup from `ip -j addr show`.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use super::RemoteShell;

const IP_ADDR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuestInterface {
    #[serde(rename = "ifname")]
    pub name: String,
    #[serde(rename = "address", default)]
    pub mac: String,
    #[serde(rename = "operstate", default)]
    pub state: String,
    #[serde(rename = "addr_info", default)]
    pub addresses: Vec<GuestAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GuestAddress {
    pub family: String,
    pub local: String,
    #[serde(default)]
    pub prefixlen: u8,
}

impl GuestInterface {
    pub fn has_ipv4(&self, ip: Ipv4Addr) -> bool {
        self.addresses
            .iter()
            .any(|a| a.family == "inet" && a.local.parse::<Ipv4Addr>().is_ok_and(|l| l == ip))
    }
}

pub fn parse_interfaces(json: &str) -> Result<Vec<GuestInterface>> {
    serde_json::from_str(json).context("Failed to parse `ip -j addr show` output")
}

/// Interface on the guest at `target` that carries `ip`.
pub fn interface_with_ip(
    shell: &dyn RemoteShell,
    target: Ipv4Addr,
    ip: Ipv4Addr,
) -> Result<GuestInterface> {
    let json = shell
        .run(target, "ip -j addr show", IP_ADDR_TIMEOUT)
        .with_context(|| format!("Failed to list interfaces on {}", target))?;
    parse_interfaces(&json)?
        .into_iter()
        .find(|iface| iface.has_ipv4(ip))
        .ok_or_else(|| anyhow!("no interface found with IP address {} on {}", ip, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemote;
    use crate::testutil::IP_ADDR_JSON as SAMPLE;

    #[test]
    fn test_parse_interfaces() {
        let ifaces = parse_interfaces(SAMPLE).unwrap();
        assert_eq!(ifaces.len(), 4);
        assert_eq!(ifaces[1].name, "enp1s0");
        assert_eq!(ifaces[1].addresses[0].prefixlen, 24);
        assert!(ifaces[3].addresses.is_empty());
        assert!(parse_interfaces("not json").is_err());
    }

    #[test]
    fn test_interface_with_ip() {
        let remote = FakeRemote::new().on("ip -j addr show", SAMPLE);
        let mgmt: Ipv4Addr = "192.168.120.10".parse().unwrap();
        let k8s: Ipv4Addr = "192.168.123.11".parse().unwrap();

        let iface = interface_with_ip(&remote, mgmt, k8s).unwrap();
        assert_eq!(iface.name, "enp2s0");
        assert_eq!(iface.mac, "52:54:00:00:01:11");

        let err = interface_with_ip(&remote, mgmt, "10.9.9.9".parse().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no interface found"));
    }
}
