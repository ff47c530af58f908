use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A configuration entry refers to something the config does not define.
///
/// Raised before any external call is made, so nothing needs undoing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigRefError {
    #[error("network '{0}' is not defined in the config")]
    UnknownNetwork(String),
    #[error("no network of type '{0}' is defined in the config")]
    MissingNetworkType(String),
    #[error("cluster '{0}' is not defined in the config")]
    UnknownCluster(String),
    #[error("VM '{0}' is not defined in the config")]
    UnknownVm(String),
    #[error("unsupported network mode '{mode}' for network '{network}'")]
    UnsupportedNetworkMode { network: String, mode: String },
    #[error("CNI '{0}' is not supported for VM deployments")]
    UnsupportedCni(String),
    #[error("cluster '{0}' has no master node")]
    NoMaster(String),
}

/// A bounded poll hit its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {waited:?} waiting for {what}")]
pub struct PollTimeout {
    pub what: String,
    pub waited: Duration,
}

/// Whether an error chain bottoms out in a [`PollTimeout`].
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<PollTimeout>())
}

/// Every failure collected by a best-effort teardown, in the order seen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct AggregateError {
    pub label: String,
    pub errors: Vec<String>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.errors.join("; "))
    }
}

/// Collects errors from independent teardown steps so one failure never
/// stops the rest.
///
/// ```
/// use dpusim_core::error::ErrorAccumulator;
///
/// let mut errs = ErrorAccumulator::new("cleanup networks errors");
/// errs.record("delete mgmt", Err::<(), _>(anyhow::anyhow!("busy")));
/// errs.record("delete k8s", Ok::<(), anyhow::Error>(()));
/// let err = errs.finish().unwrap_err();
/// assert_eq!(err.to_string(), "cleanup networks errors: delete mgmt: busy");
/// ```
#[derive(Debug)]
pub struct ErrorAccumulator {
    label: String,
    errors: Vec<String>,
}

impl ErrorAccumulator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            errors: Vec::new(),
        }
    }

    /// Record the outcome of one step. Successful results are dropped.
    pub fn record<T>(&mut self, step: &str, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(step, error = %format!("{:#}", e), "teardown step failed");
                self.errors.push(format!("{}: {:#}", step, e));
                None
            }
        }
    }

    /// Record a failure message without a step prefix.
    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing failed, otherwise one [`AggregateError`].
    pub fn finish(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(AggregateError {
            label: self.label,
            errors: self.errors,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_accumulator_empty_is_ok() {
        let errs = ErrorAccumulator::new("cleanup errors");
        assert!(errs.is_empty());
        assert!(errs.finish().is_ok());
    }

    #[test]
    fn test_accumulator_joins_with_semicolons() {
        let mut errs = ErrorAccumulator::new("cleanup errors");
        errs.push("VM cleanup: boom");
        errs.push("Network cleanup: bang");
        assert_eq!(errs.len(), 2);

        let err = errs.finish().unwrap_err();
        assert_eq!(
            err.to_string(),
            "cleanup errors: VM cleanup: boom; Network cleanup: bang"
        );
        let agg = err.downcast_ref::<AggregateError>().unwrap();
        assert_eq!(agg.errors.len(), 2);
    }

    #[test]
    fn test_record_returns_value_on_success() {
        let mut errs = ErrorAccumulator::new("x");
        let v = errs.record("step", Ok::<_, anyhow::Error>(7));
        assert_eq!(v, Some(7));
        assert!(errs.is_empty());
    }

    #[test]
    fn test_record_keeps_context_chain() {
        let mut errs = ErrorAccumulator::new("x");
        let r: anyhow::Result<()> = Err(anyhow::anyhow!("root cause")).context("outer");
        assert!(errs.record("step", r).is_none());
        let msg = errs.finish().unwrap_err().to_string();
        assert!(msg.contains("step: outer: root cause"), "{}", msg);
    }

    #[test]
    fn test_is_timeout_through_context() {
        let err = anyhow::Error::new(PollTimeout {
            what: "IP of vm1".to_string(),
            waited: Duration::from_secs(10),
        })
        .context("waiting for host1");
        assert!(is_timeout(&err));
        assert!(!is_timeout(&anyhow::anyhow!("other")));
    }

    #[test]
    fn test_config_ref_error_messages() {
        assert_eq!(
            ConfigRefError::NoMaster("c1".into()).to_string(),
            "cluster 'c1' has no master node"
        );
        assert_eq!(
            ConfigRefError::UnsupportedNetworkMode {
                network: "n".into(),
                mode: "route".into()
            }
            .to_string(),
            "unsupported network mode 'route' for network 'n'"
        );
    }
}
