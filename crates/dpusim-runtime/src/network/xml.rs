//! Libvirt `<network>` documents.

use std::borrow::Cow;
use std::fmt::Write;

use anyhow::{Result, bail};
use dpusim_core::config::{NetworkConfig, VmConfig};

/// Escape text for an XML attribute value or element body.
pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '\'', '"']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// NAT network with a Linux bridge, gateway address and DHCP.
///
/// `reservations` become `<host>` entries so nodes with a pinned MAC get
/// their address on first lease.
pub fn nat(net: &NetworkConfig, reservations: &[&VmConfig]) -> Result<String> {
    let (Some(gateway), Some(mask)) = (net.gateway, net.subnet_mask) else {
        bail!(
            "NAT network '{}' requires 'gateway' and 'subnet_mask'",
            net.name
        );
    };

    let mut xml = String::new();
    let _ = writeln!(xml, "<network>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&net.name));
    let _ = writeln!(xml, "  <forward mode='nat'/>");
    let _ = writeln!(
        xml,
        "  <bridge name='{}' stp='on' delay='0'/>",
        escape(&net.bridge_name)
    );
    let _ = writeln!(xml, "  <ip address='{}' netmask='{}'>", gateway, mask);
    let _ = writeln!(xml, "    <dhcp>");
    if let (Some(start), Some(end)) = (net.dhcp_start, net.dhcp_end) {
        let _ = writeln!(xml, "      <range start='{}' end='{}'/>", start, end);
    }
    for vm in reservations {
        if let (Some(mac), Some(ip)) = (&vm.k8s_node_mac, vm.k8s_node_ip) {
            let _ = writeln!(
                xml,
                "      <host mac='{}' name='{}' ip='{}'/>",
                escape(mac),
                escape(&vm.name),
                ip
            );
        }
    }
    let _ = writeln!(xml, "    </dhcp>");
    let _ = writeln!(xml, "  </ip>");
    let _ = writeln!(xml, "</network>");
    Ok(xml)
}

/// Plain Linux bridge, no forwarding or addressing.
pub fn linux_bridge(name: &str, bridge: &str) -> String {
    let (name, bridge) = (escape(name), escape(bridge));
    format!(
        "<network>\n  <name>{name}</name>\n  <bridge name='{bridge}' stp='on' delay='0'/>\n</network>\n"
    )
}

/// Bridge-forwarding network bound to an existing OVS bridge.
pub fn ovs_bridge(name: &str, bridge: &str) -> String {
    let (name, bridge) = (escape(name), escape(bridge));
    format!(
        "<network>\n  <name>{name}</name>\n  <forward mode='bridge'/>\n  <bridge name='{bridge}'/>\n  <virtualport type='openvswitch'/>\n</network>\n"
    )
}
