//! Kubernetes on the provisioned VMs: node preparation, kubeadm bootstrap
//! and CNI installation.

pub mod bootstrap;
pub mod cni;
pub mod guest_bridge;
pub mod kubeadm;
pub mod kubeconfig;
pub mod node_prep;

pub use bootstrap::{BootstrapPhase, ClusterBootstrapper, ClusterOutcome};
pub use cni::{CniInstaller, KubectlCni};
pub use kubeadm::ClusterBootstrapResult;
