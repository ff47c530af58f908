//! Commands inside guests. Bootstrap code talks to VMs only through
//! [`RemoteShell`].

pub mod iface;
pub mod ssh;

#[cfg(test)]
pub(crate) mod fake;

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Result, bail};

use dpusim_core::error::PollTimeout;
use dpusim_core::poll::{PollPolicy, poll_until};

pub use ssh::SshShell;

/// Exit status coreutils `timeout` reports when it had to kill the command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Deadline for a single readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }
}

pub trait RemoteShell {
    /// Run `script` on `ip` through the guest's shell and capture the
    /// result. `Err` means the command could not be launched at all; a
    /// failing or killed command is reported in [`ExecOutput`].
    fn exec(&self, ip: Ipv4Addr, script: &str, timeout: Duration) -> Result<ExecOutput>;

    /// [`Self::exec`], failing unless the command exits zero. Returns
    /// trimmed stdout. A command killed at its deadline is a [`PollTimeout`].
    fn run(&self, ip: Ipv4Addr, script: &str, timeout: Duration) -> Result<String> {
        let out = self.exec(ip, script, timeout)?;
        if out.timed_out() {
            return Err(PollTimeout {
                what: format!("remote command on {}", ip),
                waited: timeout,
            }
            .into());
        }
        if !out.success() {
            bail!(
                "remote command on {} failed (exit {}): {}",
                ip,
                out.exit_code,
                first_non_empty(&out.stderr, &out.stdout)
            );
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Block until a trivial command succeeds on `ip`.
    fn wait_until_ready(&self, ip: Ipv4Addr, policy: PollPolicy) -> Result<()> {
        poll_until(policy, &format!("SSH on {}", ip), || {
            let out = self.exec(ip, "echo ready", PROBE_TIMEOUT)?;
            Ok(out.success().then_some(()))
        })
    }
}

fn first_non_empty<'s>(a: &'s str, b: &'s str) -> &'s str {
    if a.trim().is_empty() { b.trim() } else { a.trim() }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRemote;
    use super::*;
    use dpusim_core::error::is_timeout;

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 120, 10);

    #[test]
    fn test_run_returns_trimmed_stdout() {
        let remote = FakeRemote::new().on("hostname", "node1\n");
        assert_eq!(remote.run(IP, "hostname", PROBE_TIMEOUT).unwrap(), "node1");
    }

    #[test]
    fn test_run_reports_failure_and_timeout() {
        let remote = FakeRemote::new()
            .fail("false", 3, "boom")
            .fail("sleep", TIMEOUT_EXIT_CODE, "");
        let err = remote.run(IP, "false", PROBE_TIMEOUT).unwrap_err();
        assert!(!is_timeout(&err));
        let msg = err.to_string();
        assert!(msg.contains("exit 3") && msg.contains("boom"), "{}", msg);

        let err = remote.run(IP, "sleep 999", PROBE_TIMEOUT).unwrap_err();
        assert!(is_timeout(&err));
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(err.to_string().contains("remote command on 192.168.120.10"), "{}", err);
    }

    #[test]
    fn test_wait_until_ready_times_out_for_unreachable_guest() {
        let remote = FakeRemote::new();
        remote.set_unreachable(IP);
        let policy = PollPolicy::new(Duration::from_millis(20), Duration::from_millis(5));
        let err = remote.wait_until_ready(IP, policy).unwrap_err();
        assert!(is_timeout(&err));
        assert!(remote.wait_until_ready(Ipv4Addr::LOCALHOST, policy).is_ok());
    }
}
