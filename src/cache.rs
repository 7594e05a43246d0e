//! Snapshot cache with single-flight refreshes.
//!
//! At most one collection runs at a time. Callers that arrive while it runs
//! wait on the same result instead of starting their own. The collection
//! itself runs on a spawned task, so a caller that gives up (timeout, dropped
//! request) never aborts it.

use crate::collectors::Collect;
use crate::metrics::Metrics;
use crate::state::Snapshot;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What consumers see: the snapshot plus how much to trust it.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    pub snapshot: Arc<Snapshot>,
    /// A refresh failed since this snapshot was published, or it is older
    /// than the cache's max age.
    pub is_stale: bool,
    pub last_error: Option<String>,
}

type Published = watch::Receiver<Option<Arc<Snapshot>>>;

enum Phase {
    Idle,
    Refreshing(Published),
}

struct Slot {
    current: Option<Arc<Snapshot>>,
    published_at: Option<Instant>,
    last_error: Option<String>,
    refresh_failed: bool,
    phase: Phase,
}

impl Slot {
    fn age(&self) -> Option<Duration> {
        self.published_at.map(|at| at.elapsed())
    }

    /// Stores a freshly collected snapshot and returns the one now served.
    fn publish(&mut self, snapshot: Arc<Snapshot>) -> Arc<Snapshot> {
        if snapshot.is_session_failure() {
            let message = snapshot
                .connection_error()
                .unwrap_or("remote host unreachable")
                .to_string();
            self.last_error = Some(message.clone());
            if let Some(previous) = &self.current {
                warn!(error = %message, "refresh failed, serving previous snapshot");
                self.refresh_failed = true;
                return previous.clone();
            }
            warn!(error = %message, "refresh failed with nothing cached yet");
        } else {
            self.last_error = None;
        }

        self.refresh_failed = false;
        self.current = Some(snapshot.clone());
        self.published_at = Some(Instant::now());
        snapshot
    }

    fn view(&self, max_age: Duration, timed_out: bool) -> SnapshotView {
        let too_old = self.age().map_or(true, |age| age > max_age);
        let last_error = match (&self.last_error, &self.current) {
            (Some(err), _) => Some(err.clone()),
            (None, None) => Some("no snapshot has been collected yet".to_string()),
            (None, Some(_)) => None,
        };
        SnapshotView {
            snapshot: self.current.clone().unwrap_or_default(),
            is_stale: timed_out || self.refresh_failed || too_old,
            last_error,
        }
    }
}

enum Ticket {
    Ready(Arc<Snapshot>),
    Wait(Published),
}

pub struct RefreshCache {
    collector: Arc<dyn Collect>,
    slot: Arc<Mutex<Slot>>,
    max_age: Duration,
    refresh_wait: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl RefreshCache {
    pub fn new(collector: Arc<dyn Collect>, max_age: Duration, refresh_wait: Duration) -> Self {
        Self {
            collector,
            slot: Arc::new(Mutex::new(Slot {
                current: None,
                published_at: None,
                last_error: None,
                refresh_failed: false,
                phase: Phase::Idle,
            })),
            max_age,
            refresh_wait,
            metrics: None,
        }
    }

    /// Feeds every collection and publication into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cached snapshot when younger than `max_age`, otherwise the result of
    /// a refresh (joining one already in flight).
    pub async fn get_current(&self, max_age: Duration) -> Arc<Snapshot> {
        match self.ticket(Some(max_age)).await {
            Ticket::Ready(snapshot) => snapshot,
            Ticket::Wait(rx) => self.settle(rx).await,
        }
    }

    /// Refreshes regardless of age. Joins a refresh already in flight.
    pub async fn force_refresh(&self) -> Arc<Snapshot> {
        match self.ticket(None).await {
            Ticket::Ready(snapshot) => snapshot,
            Ticket::Wait(rx) => self.settle(rx).await,
        }
    }

    /// Never fails and never waits longer than the refresh wait. When the
    /// refresh outlasts it, the cached snapshot is returned marked stale.
    pub async fn get_snapshot(&self) -> SnapshotView {
        self.bounded(self.get_current(self.max_age)).await
    }

    /// Waits for `refresh` at most the refresh wait, then returns the view
    /// of what is cached. The refresh keeps running if the wait runs out.
    pub async fn bounded(&self, refresh: impl Future<Output = Arc<Snapshot>>) -> SnapshotView {
        let timed_out = tokio::time::timeout(self.refresh_wait, refresh)
            .await
            .is_err();
        if timed_out {
            debug!(
                wait_secs = self.refresh_wait.as_secs(),
                "refresh still running, serving cached snapshot"
            );
        }
        self.slot.lock().await.view(self.max_age, timed_out)
    }

    /// Current view without triggering a refresh.
    pub async fn peek(&self) -> SnapshotView {
        self.slot.lock().await.view(self.max_age, false)
    }

    async fn settle(&self, rx: Published) -> Arc<Snapshot> {
        match wait_published(rx).await {
            Some(snapshot) => snapshot,
            None => self.slot.lock().await.current.clone().unwrap_or_default(),
        }
    }

    async fn ticket(&self, max_age: Option<Duration>) -> Ticket {
        let mut slot = self.slot.lock().await;

        if let (Some(max_age), Some(current), Some(age)) = (max_age, &slot.current, slot.age()) {
            if age <= max_age {
                return Ticket::Ready(current.clone());
            }
        }
        if let Phase::Refreshing(rx) = &slot.phase {
            return Ticket::Wait(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        slot.phase = Phase::Refreshing(rx.clone());
        drop(slot);

        let collector = self.collector.clone();
        let shared = self.slot.clone();
        let metrics = self.metrics.clone();
        let max_age = self.max_age;
        tokio::spawn(async move {
            let started = Instant::now();
            let collected = tokio::spawn(async move { collector.collect().await }).await;

            let mut slot = shared.lock().await;
            slot.phase = Phase::Idle;
            let published = match collected {
                Ok(snapshot) => {
                    if let Some(metrics) = &metrics {
                        metrics.observe_collection(&snapshot);
                    }
                    slot.publish(Arc::new(snapshot))
                }
                Err(err) => {
                    error!(error = %err, "collector task failed");
                    slot.refresh_failed = true;
                    slot.last_error = Some(format!("collector task failed: {err}"));
                    slot.current.clone().unwrap_or_default()
                }
            };
            if let Some(metrics) = &metrics {
                metrics.update_from_view(&slot.view(max_age, false));
            }
            drop(slot);

            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "refresh finished"
            );
            let _ = tx.send(Some(published));
        });

        Ticket::Wait(rx)
    }
}

async fn wait_published(mut rx: Published) -> Option<Arc<Snapshot>> {
    rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone())
}

/// Refreshes the cache every `interval` until `shutdown` is cancelled.
pub async fn run_refresh_loop(
    cache: Arc<RefreshCache>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    snapshot = cache.force_refresh() => {
                        debug!(
                            captured_at = snapshot.captured_at_unix,
                            failures = snapshot.failures.len(),
                            "refresh cycle done"
                        );
                    }
                }
            }
        }
    }
    info!("refresh loop stopped");
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::collectors::Collect;
    use crate::state::{CpuStat, GpuRecord, Snapshot, SystemResources};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    /// Counts collections; each healthy snapshot is stamped with its call number.
    #[derive(Default)]
    pub struct FakeCollector {
        pub calls: AtomicUsize,
        pub delay: StdMutex<Duration>,
        pub unreachable: AtomicBool,
    }

    impl FakeCollector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }
    }

    #[async_trait]
    impl Collect for FakeCollector {
        async fn collect(&self) -> Snapshot {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.unreachable.load(Ordering::SeqCst) {
                Snapshot::unreachable(n, "connect", "Connection refused")
            } else {
                healthy(n)
            }
        }
    }

    pub fn healthy(captured_at_unix: i64) -> Snapshot {
        Snapshot {
            captured_at_unix,
            gpus: vec![GpuRecord {
                id: "0".to_string(),
                name: "Tesla T4".to_string(),
                memory_used_mib: 1024,
                memory_total_mib: 16384,
                memory_usage_percent: 6.25,
                temperature_celsius: Some(42.0),
                power_draw_watts: Some(70.0),
                pci_bus_id: None,
                user: Some("alice".to_string()),
            }],
            system: SystemResources {
                cpu: Some(CpuStat {
                    usage_percent: 12.5,
                    core_count: 32,
                }),
                ..SystemResources::default()
            },
            ..Snapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeCollector;
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::task::JoinSet;

    fn cache(collector: &Arc<FakeCollector>, max_age: Duration) -> Arc<RefreshCache> {
        Arc::new(RefreshCache::new(
            collector.clone(),
            max_age,
            Duration::from_secs(2),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_collection() {
        let collector = FakeCollector::new();
        collector.set_delay(Duration::from_secs(1));
        let cache = cache(&collector, Duration::from_secs(60));

        let mut set = JoinSet::new();
        for _ in 0..8 {
            let cache = cache.clone();
            set.spawn(async move { cache.get_current(Duration::from_secs(60)).await });
        }
        let mut results = Vec::new();
        while let Some(result) = set.join_next().await {
            results.push(result.expect("caller task"));
        }

        assert_eq!(collector.calls(), 1);
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|s| Arc::ptr_eq(s, &results[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_snapshot_is_reused_until_max_age() {
        let collector = FakeCollector::new();
        let cache = cache(&collector, Duration::from_secs(5));

        let first = cache.get_current(Duration::from_secs(5)).await;
        tokio::time::advance(Duration::from_secs(3)).await;
        let second = cache.get_current(Duration::from_secs(5)).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(collector.calls(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        let third = cache.get_current(Duration::from_secs(5)).await;
        assert_eq!(third.captured_at_unix, 2);
        assert_eq!(collector.calls(), 2);
    }

    #[tokio::test]
    async fn session_failure_serves_previous_snapshot_as_stale() {
        let collector = FakeCollector::new();
        let cache = cache(&collector, Duration::from_secs(60));

        let view = cache.get_snapshot().await;
        assert_eq!(view.snapshot.captured_at_unix, 1);
        assert!(!view.is_stale);
        assert_eq!(view.last_error, None);

        collector.unreachable.store(true, Ordering::SeqCst);
        let served = cache.force_refresh().await;
        assert_eq!(served.captured_at_unix, 1);

        let view = cache.get_snapshot().await;
        assert_eq!(view.snapshot.captured_at_unix, 1);
        assert!(view.is_stale);
        assert_eq!(view.last_error.as_deref(), Some("Connection refused"));
        assert_eq!(collector.calls(), 2);

        collector.unreachable.store(false, Ordering::SeqCst);
        cache.force_refresh().await;
        let view = cache.get_snapshot().await;
        assert_eq!(view.snapshot.captured_at_unix, 3);
        assert!(!view.is_stale);
        assert_eq!(view.last_error, None);
    }

    #[tokio::test]
    async fn first_failure_is_published_with_its_failure_list() {
        let collector = FakeCollector::new();
        collector.unreachable.store(true, Ordering::SeqCst);
        let cache = cache(&collector, Duration::from_secs(60));

        let view = cache.get_snapshot().await;
        assert!(view.snapshot.is_session_failure());
        assert!(!view.is_stale);
        assert_eq!(view.last_error.as_deref(), Some("Connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_does_not_abort_refresh() {
        let collector = FakeCollector::new();
        collector.set_delay(Duration::from_secs(10));
        let cache = cache(&collector, Duration::from_secs(60));

        let gave_up = tokio::time::timeout(Duration::from_secs(1), cache.force_refresh()).await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = cache.get_current(Duration::from_secs(60)).await;
        assert_eq!(snapshot.captured_at_unix, 1);
        assert_eq!(collector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_returns_cached_snapshot_after_refresh_wait() {
        let collector = FakeCollector::new();
        let cache = cache(&collector, Duration::from_secs(5));
        cache.get_snapshot().await;

        collector.set_delay(Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(6)).await;

        let started = Instant::now();
        let view = cache.get_snapshot().await;
        let waited = started.elapsed();

        assert_eq!(view.snapshot.captured_at_unix, 1);
        assert!(view.is_stale);
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(30));
        assert_eq!(collector.calls(), 2);
    }

    #[tokio::test]
    async fn empty_cache_view_reports_why() {
        let collector = FakeCollector::new();
        let cache = cache(&collector, Duration::from_secs(60));

        let view = cache.peek().await;
        assert!(view.is_stale);
        assert!(view.last_error.is_some());
        assert_eq!(collector.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_polls_until_cancelled() {
        let collector = FakeCollector::new();
        let cache = cache(&collector, Duration::from_secs(60));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_refresh_loop(
            cache.clone(),
            Duration::from_secs(5),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.cancel();
        handle.await.expect("refresh loop task");

        assert_eq!(collector.calls(), 3);
    }
}
