use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

// ---------------------------------------------------------------------------
// Colored message helpers
// ---------------------------------------------------------------------------

fn prefix() -> String {
    "[dpu-sim]".bold().cyan().to_string()
}

/// Print an informational message: [dpu-sim] message
pub fn info(msg: &str) {
    eprintln!("{} {}", prefix(), msg);
}

/// Print a success message in green.
pub fn success(msg: &str) {
    eprintln!("{} {}", prefix(), msg.green());
}

/// Print an error message: [dpu-sim] ERROR: message (in red)
pub fn error(msg: &str) {
    eprintln!("{} {}", "[dpu-sim]".bold().red(), format!("ERROR: {}", msg).red());
}

pub fn warn(msg: &str) {
    eprintln!("{} {}", prefix(), msg.yellow());
}

/// Print a numbered step: [dpu-sim] Step n/total: message
pub fn step(n: u32, total: u32, msg: &str) {
    eprintln!(
        "\n{} {} {}",
        prefix(),
        format!("Step {}/{}:", n, total).bold().yellow(),
        msg,
    );
}

// ---------------------------------------------------------------------------
// Banner
// ---------------------------------------------------------------------------

/// Print a green bold banner box.
pub fn banner(lines: &[&str]) {
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    let rule = "=".repeat(width);

    eprintln!();
    eprintln!("{}", rule.bold().green());
    for line in lines {
        let pad = width - line.len() - 4;
        eprintln!(
            "{}",
            format!("  {}{}  ", line, " ".repeat(pad)).bold().green()
        );
    }
    eprintln!("{}", rule.bold().green());
    eprintln!();
}

// ---------------------------------------------------------------------------
// Interactive prompts
// ---------------------------------------------------------------------------

/// Show an interactive confirmation prompt. Returns true if confirmed.
pub fn confirm(msg: &str) -> bool {
    inquire::Confirm::new(msg)
        .with_default(false)
        .prompt()
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Spinners
// ---------------------------------------------------------------------------

/// Create and start a spinner with the given message.
/// Call `.finish_and_clear()` when done.
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Run `f` under a spinner, clearing it whatever the outcome.
pub fn with_spinner<T>(msg: &str, f: impl FnOnce() -> T) -> T {
    let pb = spinner(msg);
    let out = f();
    pb.finish_and_clear();
    out
}
