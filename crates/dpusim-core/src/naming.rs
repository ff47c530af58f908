use anyhow::{Result, bail};
use sha2::{Digest, Sha256};

/// Linux IFNAMSIZ minus the trailing NUL.
pub const MAX_IFACE_NAME: usize = 15;

/// Libvirt network name for the point link between a host and one of its DPUs.
pub fn h2d_network_name(host: &str, dpu: &str) -> String {
    format!("h2d-{}-{}", host, dpu)
}

/// OVS bridge name backing a host-to-DPU link.
///
/// `h2d-` followed by the hex of the first 8 bytes of SHA-256 over
/// `"{host}-{dpu}"`, clamped to an interface-safe name.
pub fn h2d_bridge_name(host: &str, dpu: &str) -> String {
    let digest = Sha256::digest(format!("{}-{}", host, dpu).as_bytes());
    let short: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    sanitize_bridge_name(&format!("h2d-{}", short))
}

fn is_iface_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Replace invalid characters with `-`, truncate to 15 chars, trim trailing `-`.
pub fn sanitize_bridge_name(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| if is_iface_char(c) { c } else { '-' })
        .take(MAX_IFACE_NAME)
        .collect();
    mapped.trim_end_matches('-').to_string()
}

/// Validate a bridge name against the Linux interface-name rules.
pub fn validate_bridge_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("bridge name cannot be empty");
    }
    if name.len() > MAX_IFACE_NAME {
        bail!(
            "bridge name {} is too long ({} characters, max {})",
            name,
            name.len(),
            MAX_IFACE_NAME
        );
    }
    if let Some((i, c)) = name.char_indices().find(|(_, c)| !is_iface_char(*c)) {
        bail!(
            "bridge name {} contains invalid character at position {}: {:?}",
            name,
            i,
            c
        );
    }
    Ok(())
}

/// Longest hostname label.
pub const MAX_VM_NAME: usize = 63;

/// A VM name doubles as the guest hostname and as part of image file names,
/// so it must be a hostname label: ASCII letters, digits and inner `-`.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.len() > MAX_VM_NAME {
        bail!("VM name {} is too long (max {})", name, MAX_VM_NAME);
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("VM name {} cannot start or end with '-'", name);
    }
    if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
        bail!("VM name {} contains invalid character {:?}", name, c);
    }
    Ok(())
}

/// Per-VM disk image file name.
pub fn disk_file_name(vm: &str) -> String {
    format!("{}.qcow2", vm)
}

/// Per-VM cloud-init seed image file name.
pub fn cloud_init_file_name(vm: &str) -> String {
    format!("{}-cloud-init.iso", vm)
}

/// Per-cluster kubeconfig file name.
pub fn kubeconfig_file_name(cluster: &str) -> String {
    format!("{}.kubeconfig", cluster)
}
