//! Host preflight: every external tool a run will shell out to.

use std::ffi::OsStr;
use std::path::Path;

use anyhow::{Result, bail};
use tracing::debug;

use dpusim_core::config::SimConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub tool: &'static str,
    pub purpose: &'static str,
}

const fn req(tool: &'static str, purpose: &'static str) -> Requirement {
    Requirement { tool, purpose }
}

const BASE: &[Requirement] = &[
    req("virsh", "libvirt networks and domains"),
    req("qemu-img", "VM disk overlays"),
    req("genisoimage", "cloud-init seed ISOs"),
    req("ovs-vsctl", "OVS bridges"),
    req("ip", "bridge link state"),
    req("ssh", "guest commands"),
    req("timeout", "remote command deadlines"),
];

/// Tools needed for `config`: the base set, plus `kubectl` when clusters
/// are declared and `oras` when the image comes from a registry.
pub fn required_tools(config: &SimConfig) -> Vec<Requirement> {
    let mut tools = BASE.to_vec();
    if !config.kubernetes.clusters.is_empty() {
        tools.push(req("kubectl", "CNI installation"));
    }
    if config
        .operating_system
        .image_ref
        .as_deref()
        .is_some_and(|r| !r.is_empty())
    {
        tools.push(req("oras", "OCI image pull"));
    }
    tools
}

/// Required tools not found on `path` (or `$PATH` when `None`).
pub fn missing_tools(config: &SimConfig, path: Option<&OsStr>) -> Vec<Requirement> {
    required_tools(config)
        .into_iter()
        .filter(|r| {
            let found = match path {
                Some(p) => which::which_in(r.tool, Some(p), Path::new("/")),
                None => which::which(r.tool),
            };
            match found {
                Ok(bin) => {
                    debug!(tool = r.tool, path = %bin.display(), "found");
                    false
                }
                Err(_) => true,
            }
        })
        .collect()
}

pub fn check_requirements(config: &SimConfig) -> Result<()> {
    let missing = missing_tools(config, None);
    if !missing.is_empty() {
        let list: Vec<String> = missing
            .iter()
            .map(|r| format!("  {} ({})", r.tool, r.purpose))
            .collect();
        bail!("Missing required tools on PATH:\n{}", list.join("\n"));
    }
    Ok(())
}
