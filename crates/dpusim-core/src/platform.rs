use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{Result, bail};

/// CPU architecture of the machine running the simulator.
///
/// VMs are created with the host's architecture so they run under KVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = anyhow::Error;

    /// Accepts both the kernel (`uname -m`) and Go/Debian spellings.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            other => bail!("unsupported host architecture: {}", other),
        }
    }
}

static DETECTED: OnceLock<Result<Arch, String>> = OnceLock::new();

/// Architecture of the running host. Cached after the first call.
pub fn host_arch() -> Result<Arch> {
    DETECTED
        .get_or_init(|| {
            std::env::consts::ARCH
                .parse::<Arch>()
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(anyhow::Error::msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arch_aliases() {
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("amd64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("aarch64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Aarch64);
        let err = "riscv64".parse::<Arch>().unwrap_err().to_string();
        assert!(err.contains("riscv64"));
    }

    #[test]
    fn test_host_arch_is_cached() {
        let a = host_arch().map(|a| a.to_string()).ok();
        let b = host_arch().map(|a| a.to_string()).ok();
        assert_eq!(a, b);
    }
}
