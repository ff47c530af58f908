//! OVS `br-ex` inside the guest, needed by OVN-Kubernetes shared gateway
//! mode.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::remote::RemoteShell;
use crate::remote::iface::interface_with_ip;

pub const EXTERNAL_BRIDGE: &str = "br-ex";

const SETUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// NetworkManager script that moves `k8s_if` under `br-ex`, keeps the
/// default route off `mgmt_if`, and maps `physnet1` to `br-ex`.
///
/// `br-ex` clones the k8s NIC's MAC so DHCP hands it the same lease.
pub fn br_ex_script(mgmt_if: &str, k8s_if: &str) -> String {
    format!(
        r#"set -e
BRIDGE_NAME={bridge}
IF1={mgmt_if}
IF1_CONN=$(nmcli -g GENERAL.CONNECTION device show $IF1 2>/dev/null || echo '')
IF1_CONN_EXISTS=$(nmcli -g NAME connection show "$IF1_CONN" 2>/dev/null || echo '')
IF2={k8s_if}
IF2_MAC=$(cat /sys/class/net/$IF2/address)
IF2_CONN=$(nmcli -g GENERAL.CONNECTION device show $IF2 2>/dev/null || echo '')
nmcli c add type ovs-bridge conn.interface $BRIDGE_NAME con-name $BRIDGE_NAME
nmcli c add type ovs-port conn.interface $BRIDGE_NAME master $BRIDGE_NAME con-name ovs-port-$BRIDGE_NAME
nmcli c add type ovs-interface slave-type ovs-port conn.interface $BRIDGE_NAME master ovs-port-$BRIDGE_NAME con-name ovs-if-$BRIDGE_NAME
nmcli c add type ovs-port conn.interface $IF2 master $BRIDGE_NAME con-name ovs-port-$IF2
nmcli c add type ethernet conn.interface $IF2 master ovs-port-$IF2 con-name ovs-if-$IF2
if [ -n "$IF2_CONN" ] && [ "$IF2_CONN" != "--" ]; then nmcli conn delete "$IF2_CONN"; fi
sudo ip addr flush dev $IF2
nmcli conn mod $BRIDGE_NAME connection.autoconnect yes
nmcli conn mod ovs-if-$IF2 connection.autoconnect yes
nmcli conn mod ovs-port-$IF2 connection.autoconnect yes
nmcli conn mod ovs-if-$BRIDGE_NAME connection.autoconnect yes
nmcli conn mod ovs-port-$BRIDGE_NAME connection.autoconnect yes
nmcli conn mod ovs-if-$BRIDGE_NAME ipv4.method auto
nmcli conn mod ovs-if-$BRIDGE_NAME ipv4.route-metric 50
nmcli conn mod ovs-if-$BRIDGE_NAME ipv4.never-default no
nmcli conn mod ovs-if-$BRIDGE_NAME 802-3-ethernet.cloned-mac-address $IF2_MAC
if [ -n "$IF1_CONN_EXISTS" ]; then
  nmcli conn mod "$IF1_CONN" ipv4.never-default yes
  nmcli conn mod "$IF1_CONN" ipv4.ignore-auto-dns yes
  nmcli conn up "$IF1_CONN"
fi
nmcli conn up $BRIDGE_NAME
nmcli conn up ovs-if-$IF2
nmcli conn up ovs-port-$IF2
nmcli conn up ovs-if-$BRIDGE_NAME
nmcli conn up ovs-port-$BRIDGE_NAME
ovs-vsctl add-br br-int
sudo ovs-vsctl set open_vswitch . external-ids:ovn-bridge-mappings="physnet1:{bridge}"
"#,
        bridge = EXTERNAL_BRIDGE,
    )
}

/// Find which guest NICs carry `mgmt_ip` and `k8s_ip`, then build `br-ex`
/// over the k8s one.
#[instrument(skip_all, fields(node))]
pub fn setup_br_ex(
    shell: &dyn RemoteShell,
    node: &str,
    mgmt_ip: Ipv4Addr,
    k8s_ip: Ipv4Addr,
) -> Result<()> {
    let mgmt_if = interface_with_ip(shell, mgmt_ip, mgmt_ip)
        .context("Failed to resolve management interface")?;
    let k8s_if = interface_with_ip(shell, mgmt_ip, k8s_ip)
        .context("Failed to resolve Kubernetes interface")?;
    info!(node, mgmt_if = %mgmt_if.name, k8s_if = %k8s_if.name, "setting up OVN br-ex");

    shell
        .run(mgmt_ip, &br_ex_script(&mgmt_if.name, &k8s_if.name), SETUP_TIMEOUT)
        .with_context(|| format!("Failed to set up OVN br-ex on {}", node))?;
    info!(node, "OVN br-ex ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemote;
    use crate::testutil::IP_ADDR_JSON;

    #[test]
    fn test_script_shape() {
        let s = br_ex_script("enp1s0", "enp2s0");
        assert!(s.starts_with("set -e\n"));
        assert!(s.contains("IF1=enp1s0\n"));
        assert!(s.contains("IF2=enp2s0\n"));
        assert!(s.contains("ipv4.route-metric 50"));
        assert!(s.contains("ovs-vsctl add-br br-int"));
        assert!(s.ends_with("external-ids:ovn-bridge-mappings=\"physnet1:br-ex\"\n"));
    }

    #[test]
    fn test_setup_resolves_interfaces() {
        let remote = FakeRemote::new().on("ip -j addr show", IP_ADDR_JSON);
        let mgmt: Ipv4Addr = "192.168.120.10".parse().unwrap();
        setup_br_ex(&remote, "host1", mgmt, "192.168.123.11".parse().unwrap()).unwrap();

        let last = remote.scripts().pop().unwrap();
        assert!(last.contains("IF1=enp1s0\n") && last.contains("IF2=enp2s0\n"));
        assert!(remote.log().iter().all(|(ip, _)| *ip == mgmt));
    }

    #[test]
    fn test_missing_k8s_interface_runs_nothing() {
        let remote = FakeRemote::new().on("ip -j addr show", IP_ADDR_JSON);
        let mgmt: Ipv4Addr = "192.168.120.10".parse().unwrap();
        assert!(setup_br_ex(&remote, "host1", mgmt, "10.1.1.1".parse().unwrap()).is_err());
        assert!(!remote.scripts().iter().any(|s| s.contains("nmcli")));
    }
}
