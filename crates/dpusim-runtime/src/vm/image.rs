//! Base cloud image and per-VM copy-on-write disks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use dpusim_core::config::OsConfig;

use crate::{http, shell};

/// Make sure the base image exists at `dest`, downloading it or pulling
/// it from an OCI registry otherwise. `image_ref` wins over `image_url`.
pub fn ensure_cloud_image(os: &OsConfig, dest: &Path) -> Result<()> {
    if dest.exists() {
        info!(path = %dest.display(), "cloud image already present");
        return Ok(());
    }
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    match (non_empty(&os.image_ref), non_empty(&os.image_url)) {
        (Some(reference), _) => pull_oci_image(reference, &os.image_name, dest),
        (None, Some(url)) => {
            info!(url, path = %dest.display(), "downloading cloud image");
            http::download_file(url, dest)
                .with_context(|| format!("Failed to download cloud image from {}", url))?;
            info!(path = %dest.display(), "downloaded cloud image");
            Ok(())
        }
        (None, None) => bail!("operating_system image source is not configured"),
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

/// `oras pull` the artifact into a scratch dir and copy the image out.
pub fn pull_oci_image(reference: &str, image_name: &str, dest: &Path) -> Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix("dpu-sim-oras-pull-")
        .tempdir()
        .context("Failed to create temp dir for OCI pull")?;
    let out = scratch.path().to_string_lossy();

    info!(reference, "pulling OCI cloud image");
    shell::run_host_checked("oras", &["pull", reference, "--output", &out])
        .with_context(|| format!("Failed to pull OCI cloud image {}", reference))?;

    let source = find_pulled_image(scratch.path(), image_name)?;
    stage_file(&source, dest)
        .with_context(|| format!("Failed to stage pulled cloud image {}", source.display()))?;
    info!(reference, path = %dest.display(), "pulled OCI cloud image");
    Ok(())
}

/// Copy `source` to `dest` through `<dest>.part` so an interrupted copy
/// never leaves a partial image at `dest`.
fn stage_file(source: &Path, dest: &Path) -> Result<()> {
    let partial = http::partial_path(dest);
    if let Err(e) = fs::copy(source, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(e).with_context(|| format!("Failed to write {}", partial.display()));
    }
    fs::rename(&partial, dest)
        .with_context(|| format!("Failed to move image into place: {}", dest.display()))
}

/// Pick the pulled file named `image_name`, else the only `.qcow2`.
pub fn find_pulled_image(root: &Path, image_name: &str) -> Result<PathBuf> {
    let files = regular_files(root)?;

    if !image_name.is_empty() {
        let named: Vec<&PathBuf> = files
            .iter()
            .filter(|p| p.file_name().is_some_and(|n| n == image_name))
            .collect();
        match named.as_slice() {
            [one] => return Ok((*one).clone()),
            [] => {}
            many => bail!(
                "multiple pulled files match image_name '{}': {}",
                image_name,
                join_paths(many.iter().copied())
            ),
        }
    }

    let qcow2: Vec<&PathBuf> = files
        .iter()
        .filter(|p| {
            p.extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("qcow2"))
        })
        .collect();
    match qcow2.as_slice() {
        [one] => Ok((*one).clone()),
        [] => bail!(
            "no '{}' or .qcow2 file found in pulled OCI artifact",
            image_name
        ),
        many => bail!(
            "multiple .qcow2 files found in pulled OCI artifact: {}",
            join_paths(many.iter().copied())
        ),
    }
}

fn join_paths<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> String {
    paths
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn regular_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to inspect pulled OCI artifact {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// qcow2 overlay backed by `base`, sized `size_gb`. An existing disk is
/// reused.
pub fn create_vm_disk(disk: &Path, size_gb: u32, base: &Path) -> Result<()> {
    if disk.exists() {
        info!(path = %disk.display(), "VM disk already exists");
        return Ok(());
    }
    if let Some(dir) = disk.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create image directory {}", dir.display()))?;
    }
    let base_arg = base.to_string_lossy();
    let disk_arg = disk.to_string_lossy();
    let size = format!("{}G", size_gb);
    shell::run_host_checked(
        "qemu-img",
        &[
            "create", "-f", "qcow2", "-F", "qcow2", "-b", &base_arg, &disk_arg, &size,
        ],
    )
    .with_context(|| format!("Failed to create disk {}", disk.display()))?;
    info!(path = %disk.display(), size_gb, "created VM disk");
    Ok(())
}

/// Remove a file; a missing file is already clean.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "deleted");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}
