//! Admission gate: bounded concurrency over a single shared capability.
//!
//! The gate counts admitted callers against a configured maximum. Callers above the limit wait
//! in a FIFO [`queue`], and a caller releasing its [`Permit`] hands the freed slot directly to
//! the head of the queue. A waiter whose deadline passes is resolved by the configured
//! [`TimeoutPolicy`]: either forcibly admitted over the limit, or rejected.
//!
//! Exactly one of {release handoff, timeout, abandonment} resolves any given waiter. The
//! waiter's presence in the queue, checked under the gate mutex, decides which one it is.

pub(crate) mod queue;

use std::{fmt, sync::Arc, time::Duration};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
    config::{PoolConfig, TimeoutPolicy},
    errors::AdmissionError,
    gate::queue::{WaitQueue, WaiterId},
    metrics::{pool_kv, Metrics, POOL_METRICS},
    stats::PoolStats,
};

/// Coarse state of an admission gate, derived from its counters.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Nobody is admitted.
    Idle,
    /// Some callers are admitted, and there is spare capacity.
    Admitting,
    /// Every slot is taken. New callers are queued.
    Saturated,
    /// More callers are admitted than the configured maximum.
    ///
    /// Only reachable when queued callers are force-admitted after a timeout.
    Overcommitted,
}

impl GateState {
    /// Classify gate counters.
    #[must_use]
    pub fn from_counts(admitted: usize, max: usize) -> Self {
        match admitted {
            0 => Self::Idle,
            n if n < max => Self::Admitting,
            n if n == max => Self::Saturated,
            _ => Self::Overcommitted,
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Admitting => "admitting",
            Self::Saturated => "saturated",
            Self::Overcommitted => "overcommitted",
        })
    }
}

/// Mutable gate state, guarded by a mutex.
#[derive(Debug, Default)]
struct Counters {
    /// Number of currently admitted callers.
    admitted: usize,
    /// Callers waiting for a free slot.
    queue: WaitQueue,
}

impl Counters {
    /// Return a slot, handing it over to the head of the queue if there is one.
    ///
    /// The handed-over slot is counted on behalf of the resumed waiter without re-checking
    /// the limit.
    fn release(&mut self) {
        self.admitted = self.admitted.saturating_sub(1);
        if let Some(waiter) = self.queue.pop_front() {
            self.admitted += 1;
            let id = waiter.id;
            if !waiter.resume() {
                // Waiting side is being dropped, its guard will give the slot back.
                trace!(waiter = id, "handed slot to an abandoned waiter");
            }
        }
    }
}

/// Shared part of an admission gate.
struct GateInner {
    /// Pool name.
    name: String,
    /// Pool label used in metrics.
    label: [KeyValue; 1],
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
    /// Admission ceiling.
    max: usize,
    /// Maximum time spent in the queue.
    admission_timeout: Duration,
    /// What to do with waiters that ran out of time.
    policy: TimeoutPolicy,
    /// Mutable state.
    counters: Mutex<Counters>,
}

impl GateInner {
    /// Pool name.
    fn name(&self) -> &str {
        &self.name
    }

    /// Release one slot and update metrics.
    fn release(&self) {
        let (admitted, queued) = {
            let mut counters = self.counters.lock();
            counters.release();
            (counters.admitted, counters.queue.len())
        };
        trace!(pool = self.name(), admitted, queued, "released slot");
        self.metrics.record_counts(&self.label, admitted, queued);
    }

    /// Resolve a waiter whose future is dropped before it was resolved.
    fn abandon(&self, id: WaiterId) {
        let mut counters = self.counters.lock();
        if counters.queue.remove(id).is_none() {
            // Slot was already handed over.
            counters.release();
        }
        debug!(pool = self.name(), waiter = id, "admission request abandoned");
    }
}

/// Guard for a queued admission request.
///
/// Makes sure a dropped acquire future never leaks a queue entry or a handed-over slot.
struct PendingAdmission<'g> {
    gate: &'g GateInner,
    id: WaiterId,
    armed: bool,
}

impl PendingAdmission<'_> {
    /// Mark the request as resolved.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.abandon(self.id);
        }
    }
}

/// How a permit was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    /// Free capacity was available.
    Immediate,
    /// Slot was handed over by a releasing caller.
    Handoff,
    /// Queue timeout ran out, and the caller was admitted regardless of capacity.
    Forced,
}

/// Admission gate.
///
/// Cloning a gate is cheap, and clones share state.
#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("name", &self.inner.name())
            .field("max", &self.inner.max)
            .field("admission_timeout", &self.inner.admission_timeout)
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl AdmissionGate {
    /// Create new gate from pool configuration.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let name = config.name();
        let label = pool_kv(name.clone());
        let metrics = Arc::clone(&POOL_METRICS);
        metrics.record_limits(&label, config.max_concurrent.get(), config.min_idle);
        Self {
            inner: Arc::new(GateInner {
                name: name.into_owned(),
                label,
                metrics,
                max: config.max_concurrent.get(),
                admission_timeout: config.admission_timeout,
                policy: config.on_timeout,
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Admission ceiling.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max
    }

    /// Acquire a slot, waiting in the queue if all slots are taken.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Timeout`] if the wait exceeded the admission timeout, and the
    /// gate is configured with [`TimeoutPolicy::Reject`]. With the default
    /// [`TimeoutPolicy::ForceAdmit`] this never fails.
    pub async fn acquire(&self) -> Result<Permit, AdmissionError> {
        let span = debug_span!("pool_acquire", name = self.inner.name());
        self.acquire_inner().instrument(span).await
    }

    /// Acquire a slot only if one is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Permit> {
        let started = Instant::now();
        let admitted = {
            let mut counters = self.inner.counters.lock();
            if counters.admitted >= self.inner.max {
                return None;
            }
            counters.admitted += 1;
            counters.admitted
        };
        Some(self.grant(started, Admission::Immediate, admitted))
    }

    async fn acquire_inner(&self) -> Result<Permit, AdmissionError> {
        let started = Instant::now();
        let deadline = started + self.inner.admission_timeout;
        let (id, rx) = {
            let mut counters = self.inner.counters.lock();
            if counters.admitted < self.inner.max {
                counters.admitted += 1;
                let admitted = counters.admitted;
                drop(counters);
                return Ok(self.grant(started, Admission::Immediate, admitted));
            }
            let (id, rx) = counters.queue.push(deadline);
            trace!(
                waiter = id,
                admitted = counters.admitted,
                queued = counters.queue.len(),
                "waiting for a free slot"
            );
            (id, rx)
        };
        let mut pending = PendingAdmission {
            gate: &self.inner,
            id,
            armed: true,
        };
        if let Ok(Ok(())) = timeout_at(deadline, rx).await {
            pending.disarm();
            return Ok(self.handed_over(started));
        }

        // Timed out. The waiter might still have been popped by a release racing with the
        // deadline, in which case the handoff wins.
        let mut counters = self.inner.counters.lock();
        pending.disarm();
        if counters.queue.remove(id).is_none() {
            drop(counters);
            return Ok(self.handed_over(started));
        }
        let waited = started.elapsed();
        match self.inner.policy {
            TimeoutPolicy::ForceAdmit => {
                counters.admitted += 1;
                let admitted = counters.admitted;
                drop(counters);
                warn!(
                    pool = self.inner.name(),
                    waited_ms = waited.as_millis() as u64,
                    admitted,
                    max = self.inner.max,
                    "admission timeout, admitting over the limit"
                );
                self.inner.metrics.record_timeout(&self.inner.label, "forced");
                Ok(self.grant(started, Admission::Forced, admitted))
            }
            TimeoutPolicy::Reject => {
                let queued = counters.queue.len();
                drop(counters);
                warn!(
                    pool = self.inner.name(),
                    waited_ms = waited.as_millis() as u64,
                    queued,
                    "admission timeout, rejecting caller"
                );
                self.inner
                    .metrics
                    .record_timeout(&self.inner.label, "rejected");
                Err(AdmissionError::Timeout { waited })
            }
        }
    }

    /// Build a permit for a waiter which received a slot via handoff.
    fn handed_over(&self, started: Instant) -> Permit {
        let admitted = self.inner.counters.lock().admitted;
        self.grant(started, Admission::Handoff, admitted)
    }

    /// Record admission and wrap it in a permit.
    fn grant(&self, started: Instant, how: Admission, admitted: usize) -> Permit {
        let waited = started.elapsed();
        trace!(
            pool = self.inner.name(),
            admission = ?how,
            admitted,
            waited_us = waited.as_micros() as u64,
            "admitted"
        );
        self.inner
            .metrics
            .wait_time
            .record(waited.as_secs_f64(), &self.inner.label);
        self.inner
            .metrics
            .record_counts(&self.inner.label, admitted, self.queued());
        Permit {
            gate: Arc::clone(&self.inner),
            admitted_at: Instant::now(),
            forced: how == Admission::Forced,
        }
    }

    /// Number of currently admitted callers.
    #[must_use]
    pub fn admitted(&self) -> usize {
        self.inner.counters.lock().admitted
    }

    /// Number of queued callers.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.counters.lock().queue.len()
    }

    /// Current state of the gate.
    #[must_use]
    pub fn state(&self) -> GateState {
        GateState::from_counts(self.admitted(), self.inner.max)
    }

    /// Take a consistent snapshot of gate counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (admitted, queued, next_deadline) = {
            let counters = self.inner.counters.lock();
            (
                counters.admitted,
                counters.queue.len(),
                counters.queue.next_deadline(),
            )
        };
        PoolStats::new(
            self.inner.name(),
            admitted,
            queued,
            self.inner.max,
            next_deadline.map(|d| d.saturating_duration_since(Instant::now())),
        )
    }

    /// Push current counters to metrics.
    pub(crate) fn update_metrics(&self) {
        let (admitted, queued) = {
            let counters = self.inner.counters.lock();
            (counters.admitted, counters.queue.len())
        };
        self.inner
            .metrics
            .record_counts(&self.inner.label, admitted, queued);
    }

    /// Record duration of an admitted unit of work.
    pub(crate) fn record_operation(&self, operation: &'static str, took: Duration, failed: bool) {
        self.inner.metrics.record_operation(
            &self.inner.label,
            operation,
            took.as_secs_f64(),
            failed,
        );
    }
}

/// Scoped admission token.
///
/// Holding a permit counts against the gate limit. Dropping it releases the slot on every exit
/// path, including errors, panics and cancellation of the holding future.
#[must_use = "dropping a permit releases the slot immediately"]
pub struct Permit {
    /// Originating gate.
    gate: Arc<GateInner>,
    /// Admission time.
    admitted_at: Instant,
    /// Admitted over the limit after an admission timeout.
    forced: bool,
}

impl Permit {
    /// Whether this permit was force-admitted over the limit.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Time since admission.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.admitted_at.elapsed()
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("pool", &self.gate.name())
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        // Record time spent holding the slot.
        self.gate
            .metrics
            .use_time
            .record(self.admitted_at.elapsed().as_secs_f64(), &self.gate.label);
        self.gate.release();
    }
}
