//! Admission-controlled execution of units of work against the shared client.

use std::{fmt, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;
use tracing::{debug_span, warn, Instrument};

use crate::{
    config::PoolConfig, errors::AdmissionError, gate::AdmissionGate, lease::Lease,
    monitor::Monitor, stats::PoolStats,
};

/// Shared client guarded by an admission gate.
///
/// Build one pool per backend client at process start, and hand clones of it to every consumer.
/// Cloning is cheap, all clones share the same gate and client.
pub struct Pool<C> {
    /// Shared client.
    client: Arc<C>,
    /// Admission gate.
    gate: AdmissionGate,
    /// Pool configuration.
    config: Arc<PoolConfig>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            gate: self.gate.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<C> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C> Pool<C> {
    /// Put a client under admission control.
    #[must_use]
    pub fn new(client: C, config: PoolConfig) -> Self {
        Self::from_arc(Arc::new(client), config)
    }

    /// Put an already shared client under admission control.
    #[must_use]
    pub fn from_arc(client: Arc<C>, config: PoolConfig) -> Self {
        let gate = AdmissionGate::new(&config);
        Self {
            client,
            gate,
            config: Arc::new(config),
        }
    }

    /// Pool configuration.
    ///
    /// Advisory timeouts (`idle_timeout`, `statement_timeout` and, unless enforced,
    /// `query_timeout`) are meant to be passed on to the client by the caller.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Underlying admission gate.
    #[must_use]
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Snapshot of current gate state.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.gate.stats()
    }

    /// Acquire scoped direct access to the client.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if the pool rejects callers on admission timeout.
    pub async fn acquire(&self) -> Result<Lease<C>, AdmissionError> {
        let permit = self.gate.acquire().await?;
        Ok(Lease::new(permit, Arc::clone(&self.client)))
    }

    /// Acquire scoped direct access to the client without waiting.
    #[must_use]
    pub fn try_acquire(&self) -> Option<Lease<C>> {
        self.gate
            .try_acquire()
            .map(|permit| Lease::new(permit, Arc::clone(&self.client)))
    }

    /// Run a single unit of work under admission control.
    ///
    /// The slot is released however the unit of work ends. Its result, success or failure, is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work`, or an [`AdmissionError`] converted into `E` if the
    /// caller was rejected on admission timeout or ran over an enforced query timeout.
    pub async fn query<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let span = debug_span!("pool_query", name = self.gate.name());
        self.run("query", work).instrument(span).await
    }

    /// Run a multi-step unit of work under admission control.
    ///
    /// This provides the same admission guarantees as [`Self::query`], and nothing more. It is
    /// **not** atomic: there is no rollback, and when `work` fails partway through, some of its
    /// steps may already have been applied by the backend. Callers must either use a backend-side
    /// transaction primitive inside `work`, or be prepared to deal with partial application.
    ///
    /// # Errors
    ///
    /// Same as [`Self::query`].
    pub async fn transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let span = debug_span!("pool_transaction", name = self.gate.name());
        self.run("transaction", work).instrument(span).await
    }

    async fn run<F, Fut, T, E>(&self, operation: &'static str, work: F) -> Result<T, E>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let permit = self.gate.acquire().await?;
        let started = Instant::now();
        let fut = work(Arc::clone(&self.client));
        let result = if self.config.enforce_query_timeout {
            let limit = self.config.query_timeout;
            match tokio::time::timeout(limit, fut).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(
                        operation,
                        limit_ms = limit.as_millis() as u64,
                        "unit of work exceeded query timeout"
                    );
                    Err(AdmissionError::QueryTimeout { limit }.into())
                }
            }
        } else {
            fut.await
        };
        self.gate
            .record_operation(operation, started.elapsed(), result.is_err());
        drop(permit);
        result
    }

    /// Start periodic statistics logging, if configured.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn_monitor(&self) -> Option<Monitor> {
        self.config
            .monitor_interval
            .map(|period| Monitor::spawn(self.gate.clone(), period))
    }
}

impl<C> Pool<C>
where
    C: Send + Sync + 'static,
{
    /// Wrap a handler so that every call of the returned function runs it under admission
    /// control.
    pub fn bind<F, Fut, T, E>(
        &self,
        handler: F,
    ) -> impl Fn() -> BoxFuture<'static, Result<T, E>> + Clone + Send + Sync
    where
        F: Fn(Arc<C>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<AdmissionError> + Send + 'static,
    {
        let pool = self.clone();
        move || {
            let pool = pool.clone();
            let handler = handler.clone();
            async move { pool.query(handler).await }.boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use thiserror::Error;
    use tokio::{sync::Notify, time::sleep};

    use super::*;
    use crate::{config::TimeoutPolicy, gate::GateState};

    #[derive(Debug, Error, PartialEq)]
    enum TestError {
        #[error("backend rejected query")]
        Backend,
        #[error(transparent)]
        Admission(#[from] AdmissionError),
    }

    /// Client stub counting concurrent users.
    #[derive(Default)]
    struct Backend {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Backend {
        async fn call(&self, hold: Duration) -> Result<usize, TestError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(hold).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(now)
        }
    }

    fn pool(max: usize, timeout_ms: u64) -> Pool<Backend> {
        Pool::new(
            Backend::default(),
            PoolConfig::default()
                .with_max_concurrent(max)
                .with_admission_timeout(Duration::from_millis(timeout_ms)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_admission() {
        let pool = pool(4, 5_000);
        let calls = (0..4).map(|_| {
            pool.query(|c| async move { c.call(Duration::from_millis(10)).await })
        });
        let started = Instant::now();
        futures::future::try_join_all(calls).await.unwrap();
        // Nobody queued, so everything ran side by side.
        assert_eq!(started.elapsed(), Duration::from_millis(10));
        assert_eq!(pool.client.peak.load(Ordering::SeqCst), 4);
        assert_eq!(pool.stats().admitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queueing_under_saturation() {
        let pool = pool(2, 60_000);
        let release = Arc::new(Notify::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for n in 0..5 {
            let pool = pool.clone();
            let release = Arc::clone(&release);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                pool.query(|_| async move {
                    order.lock().push(n);
                    release.notified().await;
                    Ok::<_, TestError>(())
                })
                .await
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(*order.lock(), vec![0, 1]);
        let stats = pool.stats();
        assert_eq!((stats.admitted, stats.queued), (2, 3));
        assert_eq!(stats.utilization, 100.0);
        assert_eq!(stats.state, GateState::Saturated);

        // One release admits the longest waiter, not any later one.
        release.notify_one();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!((pool.stats().admitted, pool.stats().queued), (2, 2));

        release.notify_waiters();
        for _ in 0..4 {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            release.notify_waiters();
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(pool.stats().admitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_open_timeout() {
        let pool = pool(1, 50);
        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.query(|c| async move { c.call(Duration::from_secs(1)).await })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let begin = Instant::now();
        let seen = pool
            .query(|c| async move {
                let admitted_then = c.in_flight.load(Ordering::SeqCst) + 1;
                Ok::<_, TestError>(admitted_then)
            })
            .await
            .unwrap();
        assert_eq!(begin.elapsed(), Duration::from_millis(50));
        assert_eq!(seen, 2);
        slow.await.unwrap().unwrap();
        assert_eq!(pool.client.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_admission_visible_in_stats() {
        let pool = pool(1, 50);
        let _held = pool.acquire().await.unwrap();
        let forced = pool.acquire().await.unwrap();
        assert!(forced.permit().is_forced());
        let stats = pool.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.utilization, 200.0);
        assert_eq!(stats.state, GateState::Overcommitted);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_policy_fails_caller() {
        let pool = Pool::new(
            Backend::default(),
            PoolConfig::default()
                .with_max_concurrent(1)
                .with_admission_timeout(Duration::from_millis(50))
                .with_timeout_policy(TimeoutPolicy::Reject),
        );
        let _held = pool.acquire().await.unwrap();
        let res = pool
            .query(|c| async move { c.call(Duration::ZERO).await })
            .await;
        assert!(matches!(
            res,
            Err(TestError::Admission(AdmissionError::Timeout { .. }))
        ));
        assert_eq!(pool.stats().admitted, 1);
    }

    #[tokio::test]
    async fn release_after_failure() {
        let pool = pool(3, 5_000);
        let res = pool
            .query(|_| async { Err::<(), _>(TestError::Backend) })
            .await;
        assert_eq!(res, Err(TestError::Backend));
        assert_eq!(pool.stats().admitted, 0);
    }

    #[tokio::test]
    async fn release_after_panic() {
        let pool = pool(1, 5_000);
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.query(|_| async {
                    if true {
                        panic!("unit of work blew up");
                    }
                    Ok::<(), TestError>(())
                })
                .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(pool.stats().admitted, 0);
    }

    #[tokio::test]
    async fn transaction_propagates_partial_failure() {
        let pool = pool(2, 5_000);
        let steps = Arc::new(AtomicUsize::new(0));
        let res = pool
            .transaction(|_| {
                let steps = Arc::clone(&steps);
                async move {
                    steps.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Backend)
                }
            })
            .await;
        assert_eq!(res, Err(TestError::Backend));
        // First step stays applied, nothing rolls it back.
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().admitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enforced_query_timeout() {
        let pool = Pool::new(
            Backend::default(),
            PoolConfig::default().with_query_timeout(Duration::from_millis(20), true),
        );
        let res = pool
            .query(|c| async move { c.call(Duration::from_millis(100)).await })
            .await;
        assert_eq!(
            res,
            Err(TestError::Admission(AdmissionError::QueryTimeout {
                limit: Duration::from_millis(20)
            }))
        );
        assert_eq!(pool.stats().admitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_two_slow_two_fast() {
        let pool = pool(2, 5_000);
        let begin = Instant::now();
        let durations = [100, 100, 10, 10];
        let calls = durations.map(|ms| {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.query(|c| async move {
                    let start = Instant::now();
                    c.call(Duration::from_millis(ms)).await?;
                    Ok::<_, TestError>(start)
                })
                .await
            })
        });
        let mut starts = Vec::new();
        for call in calls {
            starts.push(call.await.unwrap().unwrap() - begin);
        }
        assert_eq!(starts[0], Duration::ZERO);
        assert_eq!(starts[1], Duration::ZERO);
        assert_eq!(starts[2], Duration::from_millis(100));
        assert_eq!(starts[3], Duration::from_millis(100));
        assert_eq!(begin.elapsed(), Duration::from_millis(110));
    }

    #[tokio::test]
    async fn bound_handler() {
        let pool = pool(1, 5_000);
        let handler = pool.bind(|c: Arc<Backend>| async move { c.call(Duration::ZERO).await });
        assert_eq!(handler().await, Ok(1));
        assert_eq!(handler.clone()().await, Ok(1));
        assert_eq!(pool.stats().admitted, 0);
    }

    #[tokio::test]
    async fn lease_derefs_to_client() {
        let pool = pool(1, 5_000);
        let lease = pool.try_acquire().unwrap();
        assert_eq!(lease.in_flight.load(Ordering::SeqCst), 0);
        assert!(pool.try_acquire().is_none());
        drop(lease);
        assert!(pool.try_acquire().is_some());
    }
}
