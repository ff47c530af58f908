use std::io::Write;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{DomainInfo, DomainState, InterfaceAddresses, VirtBackend};
use crate::shell;

/// [`VirtBackend`] that drives libvirt through the `virsh` CLI.
///
/// Opening checks the URI answers; dropping logs the release. Every call
/// pins the same `-c <uri>` so a run never talks to two daemons.
pub struct VirshBackend {
    uri: String,
}

impl VirshBackend {
    /// Connect to `uri` and verify the daemon responds.
    pub fn open(uri: &str) -> Result<Self> {
        let backend = Self {
            uri: uri.to_string(),
        };
        backend
            .virsh(&["uri"])
            .with_context(|| format!("Failed to connect to libvirt at {}", uri))?;
        info!(uri, "connected to libvirt");
        Ok(backend)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        shell::run_host_checked("virsh", &full)
    }

    /// Write `xml` to a temp file and run `virsh <subcommand> <file>`.
    fn define_from_xml(&self, subcommand: &str, xml: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("dpusim-")
            .suffix(".xml")
            .tempfile()
            .context("Failed to create temp file for libvirt XML")?;
        file.write_all(xml.as_bytes())
            .context("Failed to write libvirt XML")?;
        let path = file.path().to_string_lossy().to_string();
        self.virsh(&[subcommand, &path])?;
        Ok(())
    }

    fn names(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.virsh(args)?))
    }
}

impl Drop for VirshBackend {
    fn drop(&mut self) {
        debug!(uri = %self.uri, "released libvirt connection");
    }
}

impl VirtBackend for VirshBackend {
    fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self.names(&["net-list", "--all", "--name"])?.iter().any(|n| n == name))
    }

    fn network_is_active(&self, name: &str) -> Result<bool> {
        Ok(self.names(&["net-list", "--name"])?.iter().any(|n| n == name))
    }

    fn define_network(&self, xml: &str) -> Result<()> {
        self.define_from_xml("net-define", xml)
    }

    fn set_network_autostart(&self, name: &str) -> Result<()> {
        self.virsh(&["net-autostart", name]).map(drop)
    }

    fn start_network(&self, name: &str) -> Result<()> {
        self.virsh(&["net-start", name]).map(drop)
    }

    fn destroy_network(&self, name: &str) -> Result<()> {
        self.virsh(&["net-destroy", name]).map(drop)
    }

    fn undefine_network(&self, name: &str) -> Result<()> {
        self.virsh(&["net-undefine", name]).map(drop)
    }

    fn list_networks(&self) -> Result<Vec<String>> {
        self.names(&["net-list", "--all", "--name"])
    }

    fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_domains()?.iter().any(|n| n == name))
    }

    fn domain_state(&self, name: &str) -> Result<DomainState> {
        Ok(DomainState::from_virsh(&self.virsh(&["domstate", name])?))
    }

    fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        parse_dominfo(&self.virsh(&["dominfo", name])?)
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        self.define_from_xml("define", xml)
    }

    fn set_domain_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        if enabled {
            self.virsh(&["autostart", name]).map(drop)
        } else {
            self.virsh(&["autostart", name, "--disable"]).map(drop)
        }
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.virsh(&["start", name]).map(drop)
    }

    fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.virsh(&["shutdown", name]).map(drop)
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        self.virsh(&["destroy", name]).map(drop)
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        self.virsh(&["reboot", name]).map(drop)
    }

    fn undefine_domain(&self, name: &str) -> Result<()> {
        self.virsh(&[
            "undefine",
            name,
            "--managed-save",
            "--snapshots-metadata",
            "--nvram",
        ])
        .map(drop)
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        self.names(&["list", "--all", "--name"])
    }

    fn domain_addresses(&self, name: &str) -> Result<Vec<InterfaceAddresses>> {
        Ok(parse_domifaddr(
            &self.virsh(&["domifaddr", name, "--source", "lease"])?,
        ))
    }
}

fn parse_name_list(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `virsh domifaddr` table output, keeping IPv4 rows only.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------------
///  vnet0      52:54:00:aa:bb:cc    ipv4         192.168.120.15/24
///  -          -                    ipv4         192.168.120.16/24
/// ```
/// A `-` in the name column continues the previous interface.
fn parse_domifaddr(out: &str) -> Vec<InterfaceAddresses> {
    let mut result: Vec<InterfaceAddresses> = Vec::new();
    let rows = out
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1);

    for row in rows {
        let cols: Vec<&str> = row.split_whitespace().collect();
        if cols.len() < 4 || cols[2] != "ipv4" {
            continue;
        }
        let Some(ip) = cols[3]
            .split('/')
            .next()
            .and_then(|a| a.parse::<Ipv4Addr>().ok())
        else {
            continue;
        };
        match result.last_mut() {
            Some(last) if cols[0] == "-" || cols[0] == last.name => last.ipv4.push(ip),
            _ => result.push(InterfaceAddresses {
                name: cols[0].to_string(),
                mac: cols[1].to_string(),
                ipv4: vec![ip],
            }),
        }
    }
    result
}

fn parse_dominfo(out: &str) -> Result<DomainInfo> {
    let field = |key: &str| -> Option<&str> {
        out.lines().find_map(|l| {
            let (k, v) = l.split_once(':')?;
            (k.trim() == key).then(|| v.trim())
        })
    };

    let state = DomainState::from_virsh(field("State").unwrap_or(""));
    let vcpus = field("CPU(s)")
        .and_then(|v| v.parse().ok())
        .context("dominfo output has no CPU(s) field")?;
    let memory_kib = field("Max memory")
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .context("dominfo output has no Max memory field")?;
    let autostart = field("Autostart") == Some("enable");

    Ok(DomainInfo {
        state,
        vcpus,
        memory_kib,
        autostart,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock::{self, MockResponse};

    const DOMIFADDR: &str = " Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 vnet0      52:54:00:aa:bb:cc    ipv4         192.168.120.15/24
 vnet1      52:54:00:00:01:11    ipv4         192.168.123.11/24
 -          -                    ipv4         192.168.123.99/24
 vnet2      52:54:00:dd:ee:ff    ipv6         fe80::1/64
";

    #[test]
    fn test_parse_domifaddr() {
        let ifaces = parse_domifaddr(DOMIFADDR);
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0].name, "vnet0");
        assert_eq!(ifaces[0].ipv4, vec!["192.168.120.15".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(ifaces[1].mac, "52:54:00:00:01:11");
        assert_eq!(ifaces[1].ipv4.len(), 2);
    }

    #[test]
    fn test_parse_domifaddr_empty_table() {
        let out = " Name       MAC address          Protocol     Address\n-----------------\n\n";
        assert!(parse_domifaddr(out).is_empty());
    }

    #[test]
    fn test_parse_dominfo() {
        let out = "Id:             3
Name:           host1
UUID:           0b9c6f4e-0000-0000-0000-000000000000
OS Type:        hvm
State:          running
CPU(s):         4
CPU time:       12.3s
Max memory:     4194304 KiB
Used memory:    4194304 KiB
Persistent:     yes
Autostart:      enable
";
        let info = parse_dominfo(out).unwrap();
        assert_eq!(info.state, DomainState::Running);
        assert_eq!(info.vcpus, 4);
        assert_eq!(info.memory_kib, 4194304);
        assert!(info.autostart);
    }

    #[test]
    fn test_open_pins_uri_on_every_call() {
        let (_guard, calls) = shell_mock::mock_host()
            .on("virsh -c qemu:///system list", MockResponse::ok("host1\n\ndpu1\n"))
            .install();
        let backend = VirshBackend::open("qemu:///system").unwrap();
        assert!(backend.domain_exists("dpu1").unwrap());
        assert!(!backend.domain_exists("dpu2").unwrap());
        let calls = calls.lock().unwrap();
        assert!(calls.iter().all(|c| c.starts_with("virsh -c qemu:///system ")));
        assert_eq!(calls[0], "virsh -c qemu:///system uri");
    }

    #[test]
    fn test_open_fails_when_daemon_unreachable() {
        let (_guard, _calls) = shell_mock::mock_host()
            .on("virsh", MockResponse::fail(1, "failed to connect to the hypervisor"))
            .install();
        let err = VirshBackend::open("qemu:///system").err().unwrap();
        assert!(format!("{:#}", err).contains("failed to connect"));
    }

    #[test]
    fn test_undefine_passes_cleanup_flags() {
        let (_guard, calls) = shell_mock::mock_host().install();
        let backend = VirshBackend::open("qemu:///system").unwrap();
        backend.undefine_domain("host1").unwrap();
        assert_eq!(
            calls.lock().unwrap().last().unwrap(),
            "virsh -c qemu:///system undefine host1 --managed-save --snapshots-metadata --nvram"
        );
    }

    #[test]
    fn test_define_network_uses_temp_file() {
        let (_guard, calls) = shell_mock::mock_host().install();
        let backend = VirshBackend::open("qemu:///system").unwrap();
        backend.define_network("<network/>").unwrap();
        let last = calls.lock().unwrap().last().unwrap().clone();
        assert!(last.starts_with("virsh -c qemu:///system net-define "));
        assert!(last.ends_with(".xml"));
    }
}
