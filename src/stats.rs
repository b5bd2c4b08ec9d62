//! Read-only snapshot of admission gate state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::GateState;

/// Point-in-time pool statistics.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolStats {
    /// Pool name.
    pub name: String,
    /// Number of currently admitted callers.
    pub admitted: usize,
    /// Number of callers waiting in the admission queue.
    pub queued: usize,
    /// Configured admission ceiling.
    pub max_concurrent: usize,
    /// `admitted / max_concurrent * 100`.
    ///
    /// Not clamped, so values over 100 reveal force-admitted callers.
    pub utilization: f64,
    /// Coarse gate state.
    pub state: GateState,
    /// Time left until the head of the queue runs out of patience.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub next_timeout: Option<Duration>,
}

impl PoolStats {
    pub(crate) fn new(
        name: &str,
        admitted: usize,
        queued: usize,
        max_concurrent: usize,
        next_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            admitted,
            queued,
            max_concurrent,
            utilization: admitted as f64 / max_concurrent as f64 * 100.0,
            state: GateState::from_counts(admitted, max_concurrent),
            next_timeout,
        }
    }

    /// Whether more callers are admitted than allowed.
    #[must_use]
    pub fn is_overcommitted(&self) -> bool {
        self.admitted > self.max_concurrent
    }
}
