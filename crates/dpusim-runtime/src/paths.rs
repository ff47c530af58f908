use std::path::{Path, PathBuf};

use dpusim_core::config::{DEFAULT_IMAGE_DIR, DEFAULT_NVRAM_DIR, OsConfig, SimConfig};
use dpusim_core::naming;

/// Directories the runtime writes into. Tests point these at a temp dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub image_dir: PathBuf,
    pub nvram_dir: PathBuf,
    pub kubeconfig_dir: PathBuf,
}

impl RuntimePaths {
    /// Libvirt's system directories plus the config's kubeconfig dir.
    pub fn system(config: &SimConfig) -> Self {
        Self {
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            nvram_dir: PathBuf::from(DEFAULT_NVRAM_DIR),
            kubeconfig_dir: config.kubernetes.kubeconfig_dir.clone(),
        }
    }

    /// All three directories under one root.
    pub fn under(root: &Path) -> Self {
        Self {
            image_dir: root.join("images"),
            nvram_dir: root.join("nvram"),
            kubeconfig_dir: root.join("kubeconfig"),
        }
    }

    /// Base cloud image, named by the basename of `image_name`.
    pub fn base_image(&self, os: &OsConfig) -> PathBuf {
        let file = Path::new(&os.image_name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&os.image_name));
        self.image_dir.join(file)
    }

    pub fn disk(&self, vm: &str) -> PathBuf {
        self.image_dir.join(naming::disk_file_name(vm))
    }

    pub fn cloud_init(&self, vm: &str) -> PathBuf {
        self.image_dir.join(naming::cloud_init_file_name(vm))
    }

    pub fn kubeconfig(&self, cluster: &str) -> PathBuf {
        self.kubeconfig_dir.join(naming::kubeconfig_file_name(cluster))
    }
}
