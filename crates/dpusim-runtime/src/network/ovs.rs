use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::shell;

/// Whether an OVS bridge exists. `br-exists` exits 2 for a missing bridge.
pub fn bridge_exists(bridge: &str) -> Result<bool> {
    let output = shell::run_host("ovs-vsctl", &["br-exists", bridge])?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(2) => Ok(false),
        code => bail!(
            "ovs-vsctl br-exists {} failed (exit {}): {}",
            bridge,
            code.unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

/// Create an OVS bridge and bring its link up. Existing bridges are left alone.
pub fn create_bridge(bridge: &str) -> Result<()> {
    if bridge_exists(bridge)? {
        info!(bridge, "OVS bridge already exists, skipping creation");
        return Ok(());
    }
    shell::run_host_checked("ovs-vsctl", &["add-br", bridge])
        .with_context(|| format!("Failed to create OVS bridge {}", bridge))?;
    shell::run_host_checked("ip", &["link", "set", bridge, "up"])
        .with_context(|| format!("Failed to bring up OVS bridge {}", bridge))?;
    info!(bridge, "created OVS bridge");
    Ok(())
}

/// Delete an OVS bridge. A missing bridge is already clean.
pub fn delete_bridge(bridge: &str) -> Result<()> {
    if !bridge_exists(bridge)? {
        debug!(bridge, "OVS bridge does not exist, skipping deletion");
        return Ok(());
    }
    shell::run_host_checked("ovs-vsctl", &["del-br", bridge])
        .with_context(|| format!("Failed to delete OVS bridge {}", bridge))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock::{self, MockResponse};

    #[test]
    fn test_create_missing_bridge() {
        let (_guard, calls) = shell_mock::mock_host()
            .on("ovs-vsctl br-exists", MockResponse::fail(2, ""))
            .install();
        create_bridge("h2d-abc").unwrap();
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            [
                "ovs-vsctl br-exists h2d-abc",
                "ovs-vsctl add-br h2d-abc",
                "ip link set h2d-abc up"
            ]
        );
    }

    #[test]
    fn test_create_existing_bridge_is_noop() {
        let (_guard, calls) = shell_mock::mock_host().install();
        create_bridge("br0").unwrap();
        create_bridge("br0").unwrap();
        let calls = calls.lock().unwrap();
        assert!(calls.iter().all(|c| c.starts_with("ovs-vsctl br-exists")));
    }

    #[test]
    fn test_delete_missing_bridge_is_noop() {
        let (_guard, calls) = shell_mock::mock_host()
            .on("ovs-vsctl br-exists", MockResponse::fail(2, ""))
            .install();
        delete_bridge("br0").unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_br_exists_other_failure_is_error() {
        let (_guard, _calls) = shell_mock::mock_host()
            .on("ovs-vsctl", MockResponse::fail(1, "database connection failed"))
            .install();
        let err = create_bridge("br0").unwrap_err().to_string();
        assert!(err.contains("database connection failed"), "{}", err);
    }
}
