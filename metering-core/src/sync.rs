//! Dual-store consistency.
//!
//! Admissions are written to the fast store and the durable ledger inline.
//! Durable writes that fail or time out are queued for a background retry
//! worker, and a periodic sweep re-seeds the fast store from the ledger so
//! the two converge after an outage. The ledger count is ground truth.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::counter::WindowCounter;
use crate::error::Error;
use crate::ledger::{Ledger, UsageEvent};
use crate::window::WindowKind;

const MAX_RETRY_BATCH: usize = 256;

/// A durable write that failed inline and is waiting to be replayed.
#[derive(Debug)]
enum RetryOp {
    Window {
        identity: String,
        kind: WindowKind,
        window_start: DateTime<Utc>,
        delta: i64,
    },
    Event(Box<UsageEvent>),
}

#[derive(Debug)]
struct RetryItem {
    op: RetryOp,
    attempts: u32,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub durable_write_failures: std::sync::atomic::AtomicU64,
    pub retries_flushed: std::sync::atomic::AtomicU64,
    pub retries_dropped: std::sync::atomic::AtomicU64,
    pub sweeps: std::sync::atomic::AtomicU64,
    pub sweep_divergences: std::sync::atomic::AtomicU64,
}

impl SyncMetrics {
    fn record_write_failure(&self) {
        self.durable_write_failures
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn record_retry_flushed(&self) {
        self.retries_flushed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn record_retry_dropped(&self) {
        self.retries_dropped
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn record_sweep(&self) {
        self.sweeps
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn record_divergence(&self) {
        self.sweep_divergences
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

pub struct ConsistencySync {
    ledger: Arc<dyn Ledger>,
    counter: Arc<WindowCounter>,
    durable_timeout: Duration,
    // Taken on shutdown so the worker sees the channel close and drains.
    tx: std::sync::Mutex<Option<mpsc::Sender<RetryItem>>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    pub metrics: Arc<SyncMetrics>,
}

impl ConsistencySync {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        counter: Arc<WindowCounter>,
        durable_timeout: Duration,
        queue_capacity: usize,
        flush_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let metrics = Arc::new(SyncMetrics::default());
        let worker = tokio::spawn(Self::retry_worker(
            rx,
            ledger.clone(),
            flush_interval,
            max_attempts,
            metrics.clone(),
        ));
        ConsistencySync {
            ledger,
            counter,
            durable_timeout,
            tx: std::sync::Mutex::new(Some(tx)),
            worker: std::sync::Mutex::new(Some(worker)),
            metrics,
        }
    }

    /// Records an admitted request in both stores.
    ///
    /// Fast counters cover every window so the next rate check sees this
    /// request. Durable writes are awaited inline; on failure the write is
    /// queued and the caller proceeds, trading a transient undercount in
    /// the ledger for request latency.
    pub async fn record_admission(&self, event: UsageEvent, now: DateTime<Utc>) {
        for kind in WindowKind::ALL {
            self.counter.increment(&event.identity, kind, now).await;
        }

        for kind in WindowKind::ALL {
            let window_start = kind.truncate(now);
            let write = self
                .durable(self.ledger.upsert_window(&event.identity, kind, window_start, 1))
                .await;
            if let Err(e) = write {
                warn!(
                    identity = %event.identity,
                    window = kind.as_str(),
                    "Durable window write failed, queueing for retry: {e}"
                );
                self.enqueue(RetryOp::Window {
                    identity: event.identity.clone(),
                    kind,
                    window_start,
                    delta: 1,
                });
            }
        }

        self.record_event(event).await;
    }

    /// Writes a usage event to the ledger, queueing it on failure. Used for
    /// admissions and for audited denials.
    pub async fn record_event(&self, event: UsageEvent) {
        if let Err(e) = self.durable(self.ledger.record_event(&event)).await {
            warn!(
                identity = %event.identity,
                "Durable event write failed, queueing for retry: {e}"
            );
            self.enqueue(RetryOp::Event(Box::new(event)));
        }
    }

    /// Re-seeds the fast store from every window the ledger still considers
    /// live. Runs on a timer and on demand after a fast store restart.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let rows = self.ledger.active_windows(now).await?;
        let mut repaired = 0;

        for row in &rows {
            // Every active window contains `now`, so the read below targets
            // the same key the overwrite does.
            let fast = match self.counter.current(&row.identity, row.kind, now).await {
                Ok(count) => count.unwrap_or(0),
                Err(e) => {
                    warn!(
                        identity = %row.identity,
                        window = row.kind.as_str(),
                        "Sweep could not read fast counter: {e}"
                    );
                    continue;
                }
            };

            if fast == row.count {
                continue;
            }
            if (fast - row.count).abs() > 1 {
                self.metrics.record_divergence();
                warn!(
                    identity = %row.identity,
                    window = row.kind.as_str(),
                    fast,
                    durable = row.count,
                    "Fast and durable counts diverged beyond inline write lag"
                );
            }
            if let Err(e) = self
                .counter
                .overwrite(&row.identity, row.kind, row.window_start, row.count)
                .await
            {
                warn!(
                    identity = %row.identity,
                    window = row.kind.as_str(),
                    "Sweep failed to overwrite fast counter: {e}"
                );
                continue;
            }
            repaired += 1;
        }

        self.metrics.record_sweep();
        debug!(
            windows = rows.len(),
            repaired, "Consistency sweep completed"
        );
        Ok(repaired)
    }

    /// Spawns the periodic sweep loop. The first tick fires after one full
    /// interval.
    pub fn spawn_sweeper(self: &Arc<Self>, sweep_interval: Duration) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            let mut timer = interval(sweep_interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                if let Err(e) = sync.sweep(Utc::now()).await {
                    warn!("Periodic consistency sweep failed: {e}");
                }
            }
        })
    }

    /// Closes the retry queue and waits for the worker to drain it.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().map(|mut slot| slot.take()).ok().flatten();
        drop(tx);
        let worker = self.worker.lock().map(|mut slot| slot.take()).ok().flatten();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Retry worker did not shut down cleanly: {e}");
            }
        }
    }

    async fn durable<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match timeout(self.durable_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_write_failure();
                Err(Error::new_without_logging(
                    crate::error::ErrorDetails::LedgerTimeout {
                        context: format!(
                            "durable write exceeded {}ms",
                            self.durable_timeout.as_millis()
                        ),
                    },
                ))
            }
        }
    }

    fn enqueue(&self, op: RetryOp) {
        self.metrics.record_write_failure();
        let item = RetryItem { op, attempts: 0 };
        let tx = match self.tx.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            self.metrics.record_retry_dropped();
            error!("Retry queue closed, dropping durable write: {:?}", item.op);
            return;
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.metrics.record_retry_dropped();
                error!("Retry queue full, dropping durable write: {:?}", item.op);
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                self.metrics.record_retry_dropped();
                error!("Retry queue closed, dropping durable write: {:?}", item.op);
            }
        }
    }

    async fn retry_worker(
        mut rx: mpsc::Receiver<RetryItem>,
        ledger: Arc<dyn Ledger>,
        flush_interval: Duration,
        max_attempts: u32,
        metrics: Arc<SyncMetrics>,
    ) {
        let mut buffer: Vec<RetryItem> = Vec::new();
        let mut timer = interval(flush_interval);

        info!(
            "Consistency retry worker started: flush_interval={}ms, max_attempts={}",
            flush_interval.as_millis(),
            max_attempts
        );

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(item) => {
                            buffer.push(item);
                            if buffer.len() >= MAX_RETRY_BATCH {
                                Self::flush(&ledger, &mut buffer, max_attempts, &metrics).await;
                            }
                        }
                        None => {
                            info!(
                                "Retry queue closed, draining {} pending writes",
                                buffer.len()
                            );
                            Self::flush(&ledger, &mut buffer, max_attempts, &metrics).await;
                            // No further flushes will run; anything the
                            // final attempt re-buffered is lost, so account
                            // for it.
                            for item in buffer.drain(..) {
                                metrics.record_retry_dropped();
                                error!(
                                    attempts = item.attempts,
                                    "Dropping durable write at shutdown: {:?}", item.op
                                );
                            }
                            break;
                        }
                    }
                }
                _ = timer.tick() => {
                    if !buffer.is_empty() {
                        Self::flush(&ledger, &mut buffer, max_attempts, &metrics).await;
                    }
                }
            }
        }

        info!("Consistency retry worker stopped");
    }

    async fn flush(
        ledger: &Arc<dyn Ledger>,
        buffer: &mut Vec<RetryItem>,
        max_attempts: u32,
        metrics: &SyncMetrics,
    ) {
        let mut pending = std::mem::take(buffer);
        for mut item in pending.drain(..) {
            let result = match &item.op {
                RetryOp::Window {
                    identity,
                    kind,
                    window_start,
                    delta,
                } => ledger
                    .upsert_window(identity, *kind, *window_start, *delta)
                    .await
                    .map(|_| ()),
                RetryOp::Event(event) => ledger.record_event(event).await,
            };

            match result {
                Ok(()) => metrics.record_retry_flushed(),
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts >= max_attempts {
                        metrics.record_retry_dropped();
                        error!(
                            attempts = item.attempts,
                            "Dropping durable write after repeated failures: {e}"
                        );
                    } else {
                        buffer.push(item);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeZone;

    use super::*;
    use crate::counter::memory::InMemoryCounterStore;
    use crate::error::ErrorDetails;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::{CreditAllocation, DeductOutcome, WindowRow, EVENT_ADMITTED};

    fn march_10(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    fn sync(ledger: Arc<MemoryLedger>, counter: Arc<WindowCounter>) -> ConsistencySync {
        ConsistencySync::new(
            ledger,
            counter,
            Duration::from_millis(250),
            100,
            Duration::from_millis(50),
            3,
        )
    }

    #[tokio::test]
    async fn test_admission_written_to_both_stores() {
        let ledger = Arc::new(MemoryLedger::new());
        let counter = Arc::new(WindowCounter::new(
            Arc::new(InMemoryCounterStore::new()),
            Duration::from_millis(50),
        ));
        let sync = sync(ledger.clone(), counter.clone());
        let now = march_10(14, 30, 12);

        let event = UsageEvent::admitted("u1", Some("org-1"), "/v1/complete", 120, 3, now);
        sync.record_admission(event, now).await;

        for kind in WindowKind::ALL {
            assert_eq!(counter.current("u1", kind, now).await.unwrap(), Some(1));
            assert_eq!(
                ledger.window_count("u1", kind, kind.truncate(now)).await.unwrap(),
                1
            );
        }
        let events = ledger.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EVENT_ADMITTED);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_sweep_restores_fast_counts_from_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let counter = Arc::new(WindowCounter::new(
            Arc::new(InMemoryCounterStore::new()),
            Duration::from_millis(50),
        ));
        let now = march_10(14, 30, 12);

        // Ledger knows about 7 requests; fast store was wiped.
        ledger
            .upsert_window("u1", WindowKind::Hour, WindowKind::Hour.truncate(now), 7)
            .await
            .unwrap();

        let sync = sync(ledger, counter.clone());
        let repaired = sync.sweep(now).await.unwrap();
        assert_eq!(repaired, 1);
        assert_eq!(
            counter.current("u1", WindowKind::Hour, now).await.unwrap(),
            Some(7)
        );
        assert_eq!(sync.metrics.sweep_divergences.load(Ordering::Relaxed), 1);
        assert!(logs_contain("diverged"));
    }

    #[tokio::test]
    async fn test_sweep_ignores_in_flight_lag_of_one() {
        let ledger = Arc::new(MemoryLedger::new());
        let counter = Arc::new(WindowCounter::new(
            Arc::new(InMemoryCounterStore::new()),
            Duration::from_millis(50),
        ));
        let now = march_10(14, 30, 12);

        ledger
            .upsert_window("u1", WindowKind::Minute, WindowKind::Minute.truncate(now), 3)
            .await
            .unwrap();
        for _ in 0..4 {
            counter.increment("u1", WindowKind::Minute, now).await;
        }

        let sync = sync(ledger, counter.clone());
        sync.sweep(now).await.unwrap();
        // Converged to the ledger count, but not flagged as divergence.
        assert_eq!(
            counter.current("u1", WindowKind::Minute, now).await.unwrap(),
            Some(3)
        );
        assert_eq!(sync.metrics.sweep_divergences.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let ledger = Arc::new(MemoryLedger::new());
        let counter = Arc::new(WindowCounter::new(
            Arc::new(InMemoryCounterStore::new()),
            Duration::from_millis(50),
        ));
        let sync = sync(ledger.clone(), counter);
        let now = march_10(14, 30, 12);

        let event = UsageEvent::admitted("u1", None, "/v1/complete", 10, 1, now);
        sync.record_event(event).await;
        sync.shutdown().await;

        assert_eq!(ledger.events().await.len(), 1);
    }

    /// Ledger that rejects writes until marked healthy again.
    struct FlakyLedger {
        inner: MemoryLedger,
        healthy: AtomicBool,
    }

    impl FlakyLedger {
        fn down() -> Self {
            FlakyLedger {
                inner: MemoryLedger::new(),
                healthy: AtomicBool::new(false),
            }
        }

        fn recover(&self) {
            self.healthy.store(true, Ordering::Relaxed);
        }

        fn offline(&self) -> Error {
            Error::new_without_logging(ErrorDetails::LedgerQuery {
                message: "ledger offline".to_string(),
            })
        }
    }

    #[async_trait::async_trait]
    impl Ledger for FlakyLedger {
        async fn upsert_window(
            &self,
            identity: &str,
            kind: WindowKind,
            window_start: DateTime<Utc>,
            delta: i64,
        ) -> Result<i64, Error> {
            if !self.healthy.load(Ordering::Relaxed) {
                return Err(self.offline());
            }
            self.inner.upsert_window(identity, kind, window_start, delta).await
        }

        async fn window_count(
            &self,
            identity: &str,
            kind: WindowKind,
            window_start: DateTime<Utc>,
        ) -> Result<i64, Error> {
            self.inner.window_count(identity, kind, window_start).await
        }

        async fn active_windows(&self, now: DateTime<Utc>) -> Result<Vec<WindowRow>, Error> {
            self.inner.active_windows(now).await
        }

        async fn record_event(&self, event: &UsageEvent) -> Result<(), Error> {
            if !self.healthy.load(Ordering::Relaxed) {
                return Err(self.offline());
            }
            self.inner.record_event(event).await
        }

        async fn credit_allocation(
            &self,
            org_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Option<CreditAllocation>, Error> {
            self.inner.credit_allocation(org_id, now).await
        }

        async fn deduct_credits(
            &self,
            org_id: &str,
            user_id: &str,
            amount: i64,
            idempotency_key: &str,
            now: DateTime<Utc>,
        ) -> Result<DeductOutcome, Error> {
            self.inner
                .deduct_credits(org_id, user_id, amount, idempotency_key, now)
                .await
        }

        async fn reset_quota(
            &self,
            identity: &str,
            org_id: Option<&str>,
            now: DateTime<Utc>,
        ) -> Result<(), Error> {
            self.inner.reset_quota(identity, org_id, now).await
        }

        async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
            self.inner.purge_events_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_retry_worker_lands_queued_writes_after_recovery() {
        let ledger = Arc::new(FlakyLedger::down());
        let counter = Arc::new(WindowCounter::new(
            Arc::new(InMemoryCounterStore::new()),
            Duration::from_millis(50),
        ));
        let sync = ConsistencySync::new(
            ledger.clone(),
            counter,
            Duration::from_millis(250),
            100,
            Duration::from_millis(20),
            20,
        );
        let now = march_10(14, 30, 12);

        let event = UsageEvent::admitted("u1", None, "/v1/complete", 10, 1, now);
        sync.record_event(event).await;
        assert!(ledger.inner.events().await.is_empty());
        assert_eq!(sync.metrics.durable_write_failures.load(Ordering::Relaxed), 1);

        ledger.recover();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(ledger.inner.events().await.len(), 1);
        assert_eq!(sync.metrics.retries_flushed.load(Ordering::Relaxed), 1);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_accounts_for_unflushable_writes() {
        let ledger = Arc::new(FlakyLedger::down());
        let counter = Arc::new(WindowCounter::new(
            Arc::new(InMemoryCounterStore::new()),
            Duration::from_millis(50),
        ));
        // Long flush interval so the only flush is the one on close.
        let sync = ConsistencySync::new(
            ledger.clone(),
            counter,
            Duration::from_millis(250),
            100,
            Duration::from_secs(60),
            5,
        );
        let now = march_10(14, 30, 12);

        let event = UsageEvent::admitted("u1", None, "/v1/complete", 10, 1, now);
        sync.record_event(event).await;
        sync.shutdown().await;

        // The ledger never recovered; the write is gone but not silently.
        assert!(ledger.inner.events().await.is_empty());
        assert_eq!(sync.metrics.retries_dropped.load(Ordering::Relaxed), 1);
    }
}
