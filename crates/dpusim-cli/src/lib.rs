// dpusim-cli: Clap commands, UI, output rendering
// Depends on dpusim-core and dpusim-runtime

pub mod commands;
pub mod display;
pub mod logging;
pub mod output;
pub mod ui;

pub use commands::run;
