// dpusim-runtime: everything that touches the host or the guests.
// libvirt via virsh, OVS, qemu-img, ssh and kubectl all go through `shell`.

pub mod cleanup;
pub mod http;
pub mod k8s;
pub mod network;
pub mod paths;
pub mod remote;
pub mod requirements;
pub mod session;
pub mod shell;
pub mod virt;
pub mod vm;

#[cfg(test)]
pub mod shell_mock;
#[cfg(test)]
mod testutil;

pub use session::Session;
