//! Federation error kinds
//!
//! Federate API calls return a value on success and one of these kinds on
//! failure. Only `Timeout` is locally recoverable; kinds that concern
//! federation integrity are additionally broadcast as an error action that
//! moves the federation into its terminal error phase.

use thiserror::Error;

use crate::time::Time;

/// Errors surfaced by the coordination core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FederationError {
    #[error("unknown federate or handle: {0}")]
    InvalidIdentifier(String),

    #[error("name already in use: {0}")]
    NameInUse(String),

    #[error("registration attempted after the federation began operating")]
    Frozen,

    #[error("send at {requested} violates look-ahead; earliest permitted is {earliest}")]
    LookAheadViolation { requested: Time, earliest: Time },

    #[error("operation not permitted in federate phase {0}")]
    PhaseViolation(String),

    #[error("no route to destination: {0}")]
    UnknownDestination(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("operation timed out")]
    Timeout,

    #[error("iteration limit of {0} reached without convergence")]
    IterationLimit(u64),

    #[error("router channel closed")]
    ChannelClosed,
}

impl FederationError {
    /// Process exit code for a failure that escapes to the binary.
    ///
    /// 0 is reserved for a clean finalize; configuration errors map to 1
    /// at the CLI boundary before any federation error can occur.
    pub fn exit_code(&self) -> i32 {
        match self {
            FederationError::TransportFailure(_) => 2,
            _ => 3,
        }
    }

    /// True for kinds that must tear the whole federation down.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FederationError::Timeout | FederationError::UnknownDestination(_)
        )
    }

    /// Numeric code carried in the flags word of an error action message.
    pub fn code(&self) -> u32 {
        match self {
            FederationError::InvalidIdentifier(_) => 1,
            FederationError::NameInUse(_) => 2,
            FederationError::Frozen => 3,
            FederationError::LookAheadViolation { .. } => 4,
            FederationError::PhaseViolation(_) => 5,
            FederationError::UnknownDestination(_) => 6,
            FederationError::TransportFailure(_) => 7,
            FederationError::Timeout => 8,
            FederationError::IterationLimit(_) => 9,
            FederationError::ChannelClosed => 10,
        }
    }

    /// Rebuild an error from a wire code and its detail string.
    pub fn from_code(code: u32, detail: &str) -> FederationError {
        match code {
            1 => FederationError::InvalidIdentifier(detail.to_string()),
            2 => FederationError::NameInUse(detail.to_string()),
            3 => FederationError::Frozen,
            4 => FederationError::LookAheadViolation {
                requested: Time::ZERO,
                earliest: Time::ZERO,
            },
            5 => FederationError::PhaseViolation(detail.to_string()),
            6 => FederationError::UnknownDestination(detail.to_string()),
            8 => FederationError::Timeout,
            9 => FederationError::IterationLimit(0),
            10 => FederationError::ChannelClosed,
            _ => FederationError::TransportFailure(detail.to_string()),
        }
    }
}

/// Result alias used throughout the federate-facing API.
pub type FedResult<T> = Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(FederationError::TransportFailure("lost".into()).exit_code(), 2);
        assert_eq!(FederationError::Frozen.exit_code(), 3);
    }

    #[test]
    fn test_timeout_is_recoverable() {
        assert!(!FederationError::Timeout.is_fatal());
        assert!(FederationError::NameInUse("x".into()).is_fatal());
    }

    #[test]
    fn test_code_round_trip() {
        let err = FederationError::NameInUse("x".into());
        assert_eq!(FederationError::from_code(err.code(), "x"), err);
        let err = FederationError::Frozen;
        assert_eq!(FederationError::from_code(err.code(), ""), err);
    }
}
