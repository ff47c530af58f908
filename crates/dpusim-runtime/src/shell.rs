use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::{Command, Output, Stdio};

/// Render a command and its arguments as one line for logs and mocks.
pub fn command_line(cmd: &str, args: &[&str]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    }
}

/// Run a command on the host, capturing output.
pub fn run_host(cmd: &str, args: &[&str]) -> Result<Output> {
    run(cmd, args, None)
}

fn run(cmd: &str, args: &[&str], dir: Option<&Path>) -> Result<Output> {
    #[cfg(test)]
    if let Some(output) = super::shell_mock::intercept(&command_line(cmd, args)) {
        return Ok(output);
    }

    tracing::debug!(command = %command_line(cmd, args), "run");
    let mut command = Command::new(cmd);
    command.args(args);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    command
        .output()
        .with_context(|| format!("Failed to run: {}", command_line(cmd, args)))
}

/// Run a command on the host and fail unless it exits zero.
///
/// Returns trimmed stdout. The error carries the exit code and stderr.
pub fn run_host_checked(cmd: &str, args: &[&str]) -> Result<String> {
    checked(cmd, args, run(cmd, args, None)?)
}

/// [`run_host_checked`] with `dir` as the working directory.
pub fn run_host_checked_in(dir: &Path, cmd: &str, args: &[&str]) -> Result<String> {
    checked(cmd, args, run(cmd, args, Some(dir))?)
}

fn checked(cmd: &str, args: &[&str], output: Output) -> Result<String> {
    if !output.status.success() {
        bail!(
            "Command failed (exit {}): {}: {}",
            output.status.code().unwrap_or(-1),
            command_line(cmd, args),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command on the host, inheriting stdio (visible to user).
pub fn run_host_visible(cmd: &str, args: &[&str]) -> Result<()> {
    #[cfg(test)]
    if let Some(output) = super::shell_mock::intercept(&command_line(cmd, args)) {
        if !output.status.success() {
            bail!(
                "Command failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                command_line(cmd, args)
            );
        }
        return Ok(());
    }

    let status = Command::new(cmd)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to run: {}", command_line(cmd, args)))?;

    if !status.success() {
        bail!(
            "Command failed (exit {}): {}",
            status.code().unwrap_or(-1),
            command_line(cmd, args)
        );
    }
    Ok(())
}
