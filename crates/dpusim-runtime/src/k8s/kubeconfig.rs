use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use dpusim_core::error::ErrorAccumulator;

use crate::paths::RuntimePaths;

/// Write `<dir>/<cluster>.kubeconfig`, readable by the owner only.
pub fn save_kubeconfig(paths: &RuntimePaths, cluster: &str, content: &str) -> Result<PathBuf> {
    fs::create_dir_all(&paths.kubeconfig_dir).with_context(|| {
        format!(
            "Failed to create kubeconfig directory {}",
            paths.kubeconfig_dir.display()
        )
    })?;

    let path = paths.kubeconfig(cluster);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    // mode() only applies on create; tighten a file left by an older run.
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write kubeconfig {}", path.display()))?;

    info!(cluster, path = %path.display(), "saved kubeconfig");
    Ok(path)
}

/// Remove every `*.kubeconfig` in `dir`. A missing directory is clean.
pub fn cleanup_kubeconfigs(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };

    let mut errors = ErrorAccumulator::new("cleanup kubeconfig errors");
    for entry in entries {
        let Some(entry) = errors.record(
            &format!("failed to list {}", dir.display()),
            entry.map_err(anyhow::Error::from),
        ) else {
            continue;
        };
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "kubeconfig") {
            continue;
        }
        let removed = fs::remove_file(&path).map_err(anyhow::Error::from);
        if errors
            .record(&format!("failed to remove {}", path.display()), removed)
            .is_some()
        {
            info!(path = %path.display(), "removed kubeconfig");
        }
    }
    errors.finish()
}
