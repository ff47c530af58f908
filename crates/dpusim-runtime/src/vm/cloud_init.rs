//! NoCloud seed images (`cidata` ISO with user-data and meta-data).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use dpusim_core::config::SshConfig;

use crate::shell;

pub fn meta_data(vm: &str) -> String {
    format!("instance-id: {vm}\nlocal-hostname: {vm}\n")
}

/// User-data that installs the SSH key, enables password login, refreshes
/// packages, and turns off zram swap (kubelet refuses to run with swap).
pub fn user_data(ssh_pub_key: &str, user: &str, password: &str) -> String {
    format!(
        r#"#cloud-config
users:
  - name: {user}
    sudo: ALL=(ALL) NOPASSWD:ALL
    groups: wheel
    shell: /bin/bash
    ssh_authorized_keys:
      - {key}

chpasswd:
  list: |
    {user}:{password}
  expire: false

ssh_pwauth: true

package_update: true
package_upgrade: false

packages:
  - curl
  - wget

write_files:
  - path: /etc/systemd/zram-generator.conf
    content: ""
    permissions: "0644"

runcmd:
  - systemctl enable sshd
  - systemctl start sshd
  - systemctl daemon-reload
  - systemctl restart zram-generator.service
"#,
        key = ssh_pub_key.trim(),
    )
}

/// Build `{vm}-cloud-init.iso` in `image_dir`, reusing an existing one.
pub fn create_cloud_init_iso(image_dir: &Path, vm: &str, ssh: &SshConfig) -> Result<PathBuf> {
    let iso = image_dir.join(dpusim_core::naming::cloud_init_file_name(vm));
    if iso.exists() {
        info!(vm, path = %iso.display(), "cloud-init ISO already exists");
        return Ok(iso);
    }

    let pub_key_path = ssh.public_key_path();
    let pub_key = std::fs::read_to_string(&pub_key_path).with_context(|| {
        format!("Failed to read SSH public key {}", pub_key_path.display())
    })?;

    let staging = tempfile::Builder::new()
        .prefix(&format!("cloud-init-{}-", vm))
        .tempdir()
        .context("Failed to create cloud-init staging directory")?;
    let user_data_path = staging.path().join("user-data");
    let meta_data_path = staging.path().join("meta-data");
    std::fs::write(&meta_data_path, meta_data(vm)).context("Failed to write meta-data")?;
    std::fs::write(&user_data_path, user_data(&pub_key, &ssh.user, &ssh.password))
        .context("Failed to write user-data")?;

    std::fs::create_dir_all(image_dir)
        .with_context(|| format!("Failed to create {}", image_dir.display()))?;
    let iso_arg = iso.to_string_lossy();
    let user_arg = user_data_path.to_string_lossy();
    let meta_arg = meta_data_path.to_string_lossy();
    shell::run_host_checked(
        "genisoimage",
        &[
            "-output", &iso_arg, "-volid", "cidata", "-joliet", "-rock", &user_arg, &meta_arg,
        ],
    )
    .with_context(|| format!("Failed to create cloud-init ISO for {}", vm))?;

    info!(vm, path = %iso.display(), "created cloud-init ISO");
    Ok(iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock;

    #[test]
    fn test_meta_data() {
        assert_eq!(meta_data("host1"), "instance-id: host1\nlocal-hostname: host1\n");
    }

    #[test]
    fn test_user_data_contents() {
        let ud = user_data("ssh-ed25519 AAAA test@box\n", "root", "redhat");
        assert!(ud.starts_with("#cloud-config\n"));
        assert!(ud.contains("  - name: root\n"));
        assert!(ud.contains("      - ssh-ed25519 AAAA test@box\n"));
        assert!(ud.contains("    root:redhat\n"));
        assert!(ud.contains("ssh_pwauth: true"));
        assert!(ud.contains("/etc/systemd/zram-generator.conf"));
        assert!(ud.contains("  - systemctl enable sshd\n"));
    }

    #[test]
    fn test_create_iso_invokes_genisoimage() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(dir.path().join("id_rsa.pub"), "ssh-rsa AAAA me\n").unwrap();
        let ssh = SshConfig {
            key_path: key,
            ..SshConfig::default()
        };
        let (_guard, calls) = shell_mock::mock_host().install();

        let iso = create_cloud_init_iso(dir.path(), "dpu1", &ssh).unwrap();
        assert_eq!(iso, dir.path().join("dpu1-cloud-init.iso"));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with(&format!("genisoimage -output {}", iso.display())));
        assert!(calls[0].contains("-volid cidata -joliet -rock"));
    }

    #[test]
    fn test_existing_iso_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dpu1-cloud-init.iso"), b"iso").unwrap();
        let (_guard, calls) = shell_mock::mock_host().install();
        create_cloud_init_iso(dir.path(), "dpu1", &SshConfig::default()).unwrap();
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_public_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = SshConfig {
            key_path: dir.path().join("absent"),
            ..SshConfig::default()
        };
        let err = create_cloud_init_iso(dir.path(), "dpu1", &ssh).unwrap_err();
        assert!(err.to_string().contains("SSH public key"));
    }
}
