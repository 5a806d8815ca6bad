//! Severity-based reporting on top of `tracing`.
//!
//! Recoverable problems are reported through a [`LogPolicy`], which emits a
//! tracing event and tells the caller whether the current operation should be
//! abandoned. Whether a severity aborts is a property of the policy, not of the
//! call site.

use serde::Deserialize;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Ordered message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Verbose,
    Notice,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Verbose => "verbose",
            Severity::Notice => "notice",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Decides which reported severities abort the calling operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LogPolicy {
    /// Lowest severity that aborts. `None` never aborts.
    pub abort_at: Option<Severity>,
}

impl LogPolicy {
    /// Policy that only aborts on fatal messages.
    pub fn new() -> Self {
        Self {
            abort_at: Some(Severity::Fatal),
        }
    }

    /// Policy that aborts on `severity` and above.
    pub fn abort_at(severity: Severity) -> Self {
        Self {
            abort_at: Some(severity),
        }
    }

    /// Policy that logs everything and never aborts.
    pub fn never_abort() -> Self {
        Self { abort_at: None }
    }

    pub fn aborts_on(&self, severity: Severity) -> bool {
        self.abort_at.is_some_and(|threshold| severity >= threshold)
    }

    /// Emit `message` at `severity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Aborted`] when the policy treats `severity` as fatal
    /// for the current operation.
    pub fn report(&self, severity: Severity, message: impl fmt::Display) -> Result<(), Error> {
        match severity {
            Severity::Verbose => debug!("{}", message),
            Severity::Notice => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error | Severity::Fatal => error!("{}", message),
        }
        if self.aborts_on(severity) {
            return Err(Error::Aborted {
                severity,
                message: message.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_only_fatal_aborts() {
        let policy = LogPolicy::default();
        assert!(policy.report(Severity::Error, "late slide").is_ok());
        assert!(policy.report(Severity::Fatal, "context lost").is_err());
    }

    #[test]
    fn test_abort_threshold() {
        let policy = LogPolicy::abort_at(Severity::Warning);
        assert!(policy.report(Severity::Notice, "ok").is_ok());
        match policy.report(Severity::Warning, "rejected") {
            Err(Error::Aborted { severity, message }) => {
                assert_eq!(severity, Severity::Warning);
                assert_eq!(message, "rejected");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_never_abort() {
        let policy = LogPolicy::never_abort();
        assert!(!policy.aborts_on(Severity::Fatal));
        assert!(policy.report(Severity::Fatal, "still fine").is_ok());
    }
}
