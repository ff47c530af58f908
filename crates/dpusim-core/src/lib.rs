// dpusim-core: config model, topology derivation, naming, error kinds
// No process execution here; everything is pure or filesystem-only.

pub mod config;
pub mod error;
pub mod naming;
pub mod platform;
pub mod poll;
pub mod topology;
