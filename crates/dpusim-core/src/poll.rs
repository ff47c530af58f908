use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::debug;

use crate::error::PollTimeout;

/// Deadline and tick interval for a bounded poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Default for DHCP lease discovery: 2s ticks for up to 10s.
    pub const fn ip_lookup() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(2))
    }

    /// A freshly created VM taking its first DHCP lease: 2s ticks for up to
    /// 5 minutes.
    pub const fn vm_boot() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(2))
    }

    /// Default for waiting on sshd after boot.
    pub const fn ssh_ready() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(2))
    }
}

/// Poll `probe` until it yields `Some`, sleeping `interval` between probes.
///
/// The probe runs once immediately, then once per tick. A probe error is
/// logged and treated as "not yet". On expiry returns a [`PollTimeout`]
/// carrying `what` so callers can tell a timeout from a hard failure.
pub fn poll_until<T, F>(policy: PollPolicy, what: &str, mut probe: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;

    loop {
        match probe() {
            Ok(Some(v)) => return Ok(v),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "{} probe failed", what),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(policy.interval.min(deadline - now));
        if Instant::now() >= deadline {
            // One last look at the deadline edge.
            if let Ok(Some(v)) = probe() {
                return Ok(v);
            }
            break;
        }
    }

    Err(PollTimeout {
        what: what.to_string(),
        waited: start.elapsed(),
    }
    .into())
}
