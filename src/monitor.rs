//! Periodic pool statistics reporting.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::gate::{AdmissionGate, GateState};

/// Background task logging pool statistics and updating pool metrics.
///
/// The task is stopped when the monitor is dropped.
#[derive(Debug)]
pub struct Monitor {
    /// Number of reports made so far.
    reports: Arc<AtomicU64>,
    /// Reporting task.
    task: JoinHandle<()>,
}

impl Monitor {
    /// Start reporting gate statistics every `period`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(gate: AdmissionGate, period: Duration) -> Self {
        let reports = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn({
            let reports = Arc::clone(&reports);
            async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // First tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stats = gate.stats();
                    gate.update_metrics();
                    if stats.state == GateState::Overcommitted {
                        warn!(
                            pool = %stats.name,
                            admitted = stats.admitted,
                            queued = stats.queued,
                            max = stats.max_concurrent,
                            utilization = stats.utilization,
                            "pool stats"
                        );
                    } else {
                        info!(
                            pool = %stats.name,
                            admitted = stats.admitted,
                            queued = stats.queued,
                            max = stats.max_concurrent,
                            utilization = stats.utilization,
                            "pool stats"
                        );
                    }
                    reports.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        Self { reports, task }
    }

    /// Number of reports made so far.
    #[must_use]
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
