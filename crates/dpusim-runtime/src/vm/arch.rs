//! Machine shape per host architecture, and aarch64 UEFI firmware.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use dpusim_core::platform::Arch;

/// Firmware images smaller than this are placeholders, not pflash volumes.
pub const MIN_PFLASH_SIZE: u64 = 64 * 1024 * 1024;

/// Known (loader, vars template) locations, most preferred first.
pub const AARCH64_FIRMWARE_CANDIDATES: &[(&str, &str)] = &[
    ("/usr/share/AAVMF/AAVMF_CODE.fd", "/usr/share/AAVMF/AAVMF_VARS.fd"),
    (
        "/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw",
        "/usr/share/edk2/aarch64/vars-template-pflash.raw",
    ),
    (
        "/usr/share/edk2/aarch64/QEMU_EFI-qemuvars-pflash.raw",
        "/usr/share/edk2/aarch64/vars-template-pflash.raw",
    ),
    (
        "/usr/share/edk2/aarch64/QEMU_EFI-pflash.qcow2",
        "/usr/share/edk2/aarch64/vars-template-pflash.qcow2",
    ),
    (
        "/usr/share/edk2/aarch64/QEMU_EFI-qemuvars-pflash.qcow2",
        "/usr/share/edk2/aarch64/vars-template-pflash.qcow2",
    ),
    (
        "/usr/share/edk2/aarch64/QEMU_EFI.fd",
        "/usr/share/edk2/aarch64/QEMU_VARS.fd",
    ),
    (
        "/usr/share/edk2/aarch64/edk2-aarch64-code.fd",
        "/usr/share/edk2/aarch64/edk2-aarch64-vars.fd",
    ),
    (
        "/usr/share/edk2/aarch64/edk2-arm-code.fd",
        "/usr/share/edk2/aarch64/edk2-arm-vars.fd",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiFirmware {
    pub loader: PathBuf,
    pub vars_template: PathBuf,
}

/// Everything in the domain XML that depends on the CPU architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchSpec {
    pub libvirt_arch: &'static str,
    pub machine: &'static str,
    pub cpu_mode: &'static str,
    pub emulator: &'static str,
    pub firmware: Option<UefiFirmware>,
    pub enable_iommu: bool,
    pub enable_apic: bool,
    pub enable_acpi: bool,
}

/// Arch spec for the host, searching the standard firmware locations.
pub fn host_arch_spec(arch: Arch) -> Result<ArchSpec> {
    arch_spec_with_candidates(arch, AARCH64_FIRMWARE_CANDIDATES)
}

pub fn arch_spec_with_candidates<P: AsRef<Path>>(
    arch: Arch,
    candidates: &[(P, P)],
) -> Result<ArchSpec> {
    match arch {
        Arch::Aarch64 => {
            let Some(firmware) = find_uefi_firmware(candidates) else {
                bail!(
                    "missing aarch64 UEFI firmware: install edk2/aavmf and ensure a \
                     QEMU_EFI pflash image and vars template (>= 64 MiB each) are available"
                );
            };
            debug!(loader = %firmware.loader.display(), "selected UEFI firmware");
            Ok(ArchSpec {
                libvirt_arch: "aarch64",
                machine: "virt",
                cpu_mode: "host-passthrough",
                emulator: "/usr/bin/qemu-system-aarch64",
                firmware: Some(firmware),
                enable_iommu: false,
                enable_apic: false,
                enable_acpi: true,
            })
        }
        Arch::X86_64 => Ok(ArchSpec {
            libvirt_arch: "x86_64",
            machine: "q35",
            cpu_mode: "host-passthrough",
            emulator: "/usr/libexec/qemu-kvm",
            firmware: None,
            enable_iommu: true,
            enable_apic: true,
            enable_acpi: true,
        }),
    }
}

/// First candidate whose loader and vars template are both regular files of
/// at least [`MIN_PFLASH_SIZE`].
pub fn find_uefi_firmware<P: AsRef<Path>>(candidates: &[(P, P)]) -> Option<UefiFirmware> {
    let usable = |p: &Path| {
        fs::metadata(p)
            .map(|m| !m.is_dir() && m.len() >= MIN_PFLASH_SIZE)
            .unwrap_or(false)
    };
    candidates.iter().find_map(|(loader, vars)| {
        let (loader, vars) = (loader.as_ref(), vars.as_ref());
        (usable(loader) && usable(vars)).then(|| UefiFirmware {
            loader: loader.to_path_buf(),
            vars_template: vars.to_path_buf(),
        })
    })
}

/// `{nvram_dir}/{vm}_VARS{ext}`, keeping the template's extension (`.fd`
/// when it has none).
pub fn nvram_path(nvram_dir: &Path, vm: &str, template: &Path) -> PathBuf {
    let ext = template
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".fd".to_string());
    nvram_dir.join(format!("{}_VARS{}", vm, ext))
}

/// Copy the vars template to the VM's NVRAM file once. An existing file is
/// reused as is.
pub fn ensure_uefi_nvram(nvram_dir: &Path, vm: &str, template: &Path) -> Result<PathBuf> {
    let path = nvram_path(nvram_dir, vm, template);
    fs::create_dir_all(nvram_dir)
        .with_context(|| format!("Failed to create NVRAM directory {}", nvram_dir.display()))?;

    let mut src = fs::File::open(template)
        .with_context(|| format!("Failed to open NVRAM template {}", template.display()))?;
    let mut dst = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "reusing existing NVRAM");
            return Ok(path);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to create NVRAM {}", path.display()));
        }
    };
    if let Err(e) = io::copy(&mut src, &mut dst) {
        let _ = fs::remove_file(&path);
        return Err(e).with_context(|| format!("Failed to copy NVRAM template to {}", path.display()));
    }
    info!(path = %path.display(), "created UEFI NVRAM");
    Ok(path)
}

/// Remove every `{vm}_VARS*` file. A missing directory is already clean.
pub fn delete_uefi_nvram(nvram_dir: &Path, vm: &str) -> Result<()> {
    let prefix = format!("{}_VARS", vm);
    let entries = match fs::read_dir(nvram_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", nvram_dir.display()));
        }
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", nvram_dir.display()))?;
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "deleted UEFI NVRAM"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to delete UEFI NVRAM {}", path.display()));
            }
        }
    }
    Ok(())
}
