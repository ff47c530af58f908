//! # dpusim: libvirt-based DPU topology simulator
//!
//! Facade crate that re-exports the dpu-sim workspace crates so consumers
//! can depend on a single `dpusim` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | dpusim-core | Config model, topology, naming, error kinds |
//! | [`runtime`] | dpusim-runtime | libvirt, OVS, VMs, remote shell, Kubernetes bootstrap, cleanup |
//! | [`cli`] | dpusim-cli | `dpu-sim` commands and output |

pub use dpusim_cli as cli;
pub use dpusim_core as core;
pub use dpusim_runtime as runtime;
