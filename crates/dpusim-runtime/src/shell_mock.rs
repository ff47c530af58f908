//! Test mock for `shell::run_host` and friends.
//!
//! A thread-local handler intercepts host commands during tests. Each
//! intercepted command line is recorded so tests can assert on what would
//! have run.

use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

/// Mock response for a host command.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub(crate) fn to_output(&self) -> Output {
        Output {
            // Unix exit code encoding: status = code << 8
            status: ExitStatus::from_raw(self.exit_code << 8),
            stdout: self.stdout.as_bytes().to_vec(),
            stderr: self.stderr.as_bytes().to_vec(),
        }
    }
}

type MockHandler = Box<dyn Fn(&str) -> MockResponse>;

thread_local! {
    static HANDLER: RefCell<Option<MockHandler>> = const { RefCell::new(None) };
}

/// Guard that clears the mock handler on drop.
pub struct MockGuard;

impl Drop for MockGuard {
    fn drop(&mut self) {
        HANDLER.with(|h| *h.borrow_mut() = None);
    }
}

/// Try to intercept a host command via the installed mock handler.
pub(crate) fn intercept(command: &str) -> Option<Output> {
    HANDLER.with(|h| h.borrow().as_ref().map(|f| f(command).to_output()))
}

/// Install an arbitrary handler. Useful when responses depend on state.
pub fn install_handler(handler: impl Fn(&str) -> MockResponse + 'static) -> MockGuard {
    HANDLER.with(|h| *h.borrow_mut() = Some(Box::new(handler)));
    MockGuard
}

/// Every command line the mock saw, in order.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Build a prefix-matching mock. Unmatched commands succeed with no output.
pub fn mock_host() -> MockHostBuilder {
    MockHostBuilder { rules: Vec::new() }
}

pub struct MockHostBuilder {
    rules: Vec<(String, MockResponse)>,
}

impl MockHostBuilder {
    /// Respond with `response` to any command line starting with `prefix`.
    /// Earlier rules win.
    pub fn on(mut self, prefix: &str, response: MockResponse) -> Self {
        self.rules.push((prefix.to_string(), response));
        self
    }

    /// Install the mock. Returns a guard (clears on drop) and the call log.
    pub fn install(self) -> (MockGuard, CallLog) {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        let rules = self.rules;
        let guard = install_handler(move |command: &str| {
            log.lock().unwrap().push(command.to_string());
            rules
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, resp)| resp.clone())
                .unwrap_or_else(MockResponse::empty)
        });
        (guard, calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_handler_means_no_intercept() {
        assert!(intercept("anything").is_none());
    }

    #[test]
    fn test_prefix_rules_first_match_wins() {
        let (_guard, calls) = mock_host()
            .on("ovs-vsctl br-exists", MockResponse::fail(2, ""))
            .on("ovs-vsctl", MockResponse::ok("x"))
            .install();
        let a = intercept("ovs-vsctl br-exists br0").unwrap();
        assert_eq!(a.status.code(), Some(2));
        let b = intercept("ovs-vsctl add-br br0").unwrap();
        assert_eq!(b.stdout, b"x");
        let c = intercept("ip link set br0 up").unwrap();
        assert!(c.status.success());
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_guard_clears_handler() {
        {
            let _guard = install_handler(|_| MockResponse::empty());
            assert!(intercept("x").is_some());
        }
        assert!(intercept("x").is_none());
    }
}
