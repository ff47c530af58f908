use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use dpusim_core::config::SshConfig;

use super::{ExecOutput, RemoteShell};
use crate::shell;

/// Non-interactive `ssh` with host key checking off, since every guest is
/// freshly created and gets a new host key.
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "ConnectTimeout=5",
    "-o",
    "BatchMode=yes",
];

/// [`RemoteShell`] over the host's `ssh` client, with the deadline enforced
/// by coreutils `timeout`.
#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    key_path: PathBuf,
}

impl SshShell {
    pub fn new(ssh: &SshConfig) -> Self {
        Self {
            user: ssh.user.clone(),
            key_path: ssh.key_path.clone(),
        }
    }

    /// Arguments for `timeout`, i.e. `N ssh -i key [opts] user@ip script`.
    pub fn command_args(&self, ip: Ipv4Addr, script: &str, timeout: Duration) -> Vec<String> {
        let mut args = vec![
            timeout.as_secs().max(1).to_string(),
            "ssh".to_string(),
            "-i".to_string(),
            self.key_path.to_string_lossy().into_owned(),
        ];
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        args.push(format!("{}@{}", self.user, ip));
        args.push(script.to_string());
        args
    }
}

impl RemoteShell for SshShell {
    fn exec(&self, ip: Ipv4Addr, script: &str, timeout: Duration) -> Result<ExecOutput> {
        let args = self.command_args(ip, script, timeout);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!(%ip, user = %self.user, timeout_secs = timeout.as_secs(), "ssh exec");

        let output = shell::run_host("timeout", &args)
            .with_context(|| format!("Failed to launch ssh to {}", ip))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TIMEOUT_EXIT_CODE;
    use crate::shell_mock::{self, MockResponse};

    fn shell() -> SshShell {
        SshShell::new(&SshConfig {
            user: "root".into(),
            key_path: PathBuf::from("/keys/id_rsa"),
            password: "x".into(),
        })
    }

    #[test]
    fn test_command_line_carries_deadline_and_options() {
        let ip = Ipv4Addr::new(192, 168, 120, 10);
        let args = shell().command_args(ip, "uname -m", Duration::from_secs(300));
        assert_eq!(args[0], "300");
        assert_eq!(&args[1..4], ["ssh", "-i", "/keys/id_rsa"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert_eq!(args[args.len() - 2], "root@192.168.120.10");
        assert_eq!(args[args.len() - 1], "uname -m");
    }

    #[test]
    fn test_sub_second_deadline_rounds_up() {
        let args = shell().command_args(Ipv4Addr::LOCALHOST, "true", Duration::from_millis(10));
        assert_eq!(args[0], "1");
    }

    #[test]
    fn test_exec_captures_output() {
        let (_guard, calls) = shell_mock::mock_host()
            .on("timeout 30 ssh", MockResponse::ok("x86_64\n"))
            .install();
        let out = shell()
            .exec(Ipv4Addr::LOCALHOST, "uname -m", Duration::from_secs(30))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "x86_64\n");
        assert!(calls.lock().unwrap()[0].ends_with("root@127.0.0.1 uname -m"));
    }

    #[test]
    fn test_killed_command_is_a_timeout() {
        let (_guard, _calls) = shell_mock::mock_host()
            .on("timeout", MockResponse::fail(TIMEOUT_EXIT_CODE, ""))
            .install();
        let s = shell();
        let out = s
            .exec(Ipv4Addr::LOCALHOST, "sleep 60", Duration::from_secs(1))
            .unwrap();
        assert!(out.timed_out());
        assert!(s.run(Ipv4Addr::LOCALHOST, "sleep 60", Duration::from_secs(1)).is_err());
    }
}
