//! Crate error type.
//!
//! Most operations in this crate return a [`Result`]. A smaller set of
//! contract violations (resuming a fiber that's already running, tearing
//! down a scheduler with live workers, a failed context switch) are
//! considered unrecoverable: they are logged at `error!` and the process
//! aborts instead of being threaded through `Result`.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("stack allocation failed: {0}")]
    StackAllocation(String),
}

impl Error {
    pub(crate) fn contract_violation(msg: impl Into<String>) -> Self {
        Error::ContractViolation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "io error: timed out");
    }

    #[test]
    fn contract_violation_formats() {
        let err = Error::contract_violation("fiber is not TERM or INIT");
        assert_eq!(
            err.to_string(),
            "contract violation: fiber is not TERM or INIT"
        );
    }
}
