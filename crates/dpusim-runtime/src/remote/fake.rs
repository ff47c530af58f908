//! Scripted [`RemoteShell`] for bootstrap tests.

use std::cell::RefCell;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;

use super::{ExecOutput, RemoteShell};

/// Answers by substring rules, first match wins; unmatched scripts succeed
/// with no output. Every script is logged with its target.
#[derive(Default)]
pub struct FakeRemote {
    rules: Vec<(String, ExecOutput)>,
    log: RefCell<Vec<(Ipv4Addr, String)>>,
    unreachable: RefCell<HashSet<Ipv4Addr>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: &str, stdout: &str) -> Self {
        self.rules.push((
            needle.to_string(),
            ExecOutput {
                stdout: stdout.to_string(),
                ..ExecOutput::default()
            },
        ));
        self
    }

    pub fn fail(mut self, needle: &str, exit_code: i32, stderr: &str) -> Self {
        self.rules.push((
            needle.to_string(),
            ExecOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        ));
        self
    }

    /// Every exec to `ip` fails the way a refused connection does.
    pub fn set_unreachable(&self, ip: Ipv4Addr) {
        self.unreachable.borrow_mut().insert(ip);
    }

    pub fn log(&self) -> Vec<(Ipv4Addr, String)> {
        self.log.borrow().clone()
    }

    /// Scripts sent anywhere, minus readiness probes.
    pub fn scripts(&self) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter(|(_, s)| s != "echo ready")
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn targets_of(&self, needle: &str) -> Vec<Ipv4Addr> {
        self.log
            .borrow()
            .iter()
            .filter(|(_, s)| s.contains(needle))
            .map(|(ip, _)| *ip)
            .collect()
    }
}

impl RemoteShell for FakeRemote {
    fn exec(&self, ip: Ipv4Addr, script: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.log.borrow_mut().push((ip, script.to_string()));
        if self.unreachable.borrow().contains(&ip) {
            return Ok(ExecOutput {
                stderr: "Connection refused".to_string(),
                exit_code: 255,
                ..ExecOutput::default()
            });
        }
        Ok(self
            .rules
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}
