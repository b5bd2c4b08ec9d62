//! Error types produced by the admission layer itself.

use std::time::Duration;

use thiserror::Error;

/// Error type returned when admission control refuses or cuts short a unit of work.
///
/// Failures of the unit of work itself are never wrapped in this type. Executors require the
/// caller's error type to implement `From<AdmissionError>`, and otherwise propagate the
/// caller's error unchanged.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdmissionError {
    /// Caller waited in the admission queue longer than allowed, and the pool is configured to
    /// reject such callers instead of force-admitting them.
    #[error("admission timeout: waited {waited:?} for a free slot")]
    Timeout {
        /// Time spent in the queue.
        waited: Duration,
    },
    /// Admitted unit of work ran longer than the enforced query timeout.
    #[error("query timeout: unit of work exceeded {limit:?}")]
    QueryTimeout {
        /// Configured query timeout.
        limit: Duration,
    },
}
