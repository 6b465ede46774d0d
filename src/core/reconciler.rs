//! Metrics reconciliation engine.
//!
//! Seeds a [`ReconciledView`] from a snapshot, merges `metrics.update` deltas
//! into it, and replaces it wholesale with a fresh snapshot on every
//! `connected` transition of the push channel.
//!
//! # Ordering
//! Every fetch belongs to a generation. Starting a fetch bumps the generation
//! and empties the pending buffer; deltas received while a fetch is in
//! flight are buffered and replayed in receipt order on top of the snapshot
//! once it lands. A result from a superseded generation is discarded, so a
//! resync always ends with exactly the newest snapshot plus the deltas that
//! arrived after it was requested.
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{runtime::Handle, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::{
    config::models::SnapshotConfig,
    core::{
        channel::ConnectionManager,
        model::{
            ConnectionState, DeltaEvent, GlobalDelta, METRICS_UPDATE, Period, ReconciledView,
            Snapshot, ViewStatus,
        },
        registry::Subscription,
        snapshot_cache::SnapshotCache,
    },
    metrics::{self, FetchTimer},
    ports::snapshot_source::{FetchError, SnapshotSource},
    tracing_setup::create_fetch_span,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tuning knobs of one engine
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSettings {
    /// A cached snapshot younger than this seeds the engine without a pull
    pub freshness_window: Duration,
    pub retry_interval: Duration,
    /// Forced refresh cadence, `None` disables it
    pub refresh_interval: Option<Duration>,
    pub max_pending_deltas: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from(&SnapshotConfig::default())
    }
}

impl From<&SnapshotConfig> for ReconcileSettings {
    fn from(config: &SnapshotConfig) -> Self {
        Self {
            freshness_window: config.freshness_window(),
            retry_interval: config.retry_interval(),
            refresh_interval: config.refresh_interval(),
            max_pending_deltas: config.max_pending_deltas.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// No snapshot has landed yet
    Seeding,
    /// Merging deltas into the view
    Live,
    /// A replacement snapshot is being fetched
    Resyncing,
}

struct EngineState {
    phase: EnginePhase,
    view: Option<ReconciledView>,
    generation: u64,
    pending: VecDeque<(GlobalDelta, DateTime<Utc>)>,
    dropped_pending: u64,
    last_fetch_error: Option<FetchError>,
}

struct EngineInner {
    period: Period,
    source: Arc<dyn SnapshotSource>,
    cache: Arc<SnapshotCache>,
    settings: ReconcileSettings,
    state: Mutex<EngineState>,
    view_tx: watch::Sender<ViewStatus>,
    live_updates: AtomicBool,
    cancel: CancellationToken,
    runtime: Handle,
}

impl EngineInner {
    fn publish_stale(&self, state: &EngineState) {
        if let Some(view) = &state.view {
            self.view_tx.send_replace(ViewStatus::Stale(view.clone()));
        }
    }

    /// Start a new fetch generation. `force` bypasses the freshness cache.
    fn begin_fetch(self: &Arc<Self>, force: bool, reason: &'static str) {
        if self.cancel.is_cancelled() {
            return;
        }

        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            if !state.pending.is_empty() {
                debug!(discarded = state.pending.len(), "Discarding deltas buffered for a superseded fetch");
                state.pending.clear();
                metrics::set_deltas_buffered(0);
            }
            state.phase = if state.view.is_some() {
                EnginePhase::Resyncing
            } else {
                EnginePhase::Seeding
            };
            self.publish_stale(&state);
            state.generation
        };

        if force {
            // Whatever is cached predates the reason for this resync
            self.cache.invalidate(self.period);
            metrics::increment_resyncs();
            info!(period = %self.period, generation, reason, "Resyncing snapshot");
        } else if let Some(snapshot) = self.cache.fresh(self.period, self.settings.freshness_window) {
            debug!(period = %self.period, generation, "Seeding from cached snapshot");
            self.install(generation, snapshot);
            return;
        }

        self.runtime.spawn(fetch_loop(
            Arc::downgrade(self),
            Arc::clone(&self.source),
            self.period,
            generation,
            self.settings.retry_interval,
            self.cancel.clone(),
        ));
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.cancel.is_cancelled() && lock(&self.state).generation == generation
    }

    /// Replace the view with `snapshot` and replay buffered deltas.
    fn install(&self, generation: u64, snapshot: Snapshot) {
        let mut state = lock(&self.state);
        if state.generation != generation || self.cancel.is_cancelled() {
            debug!(generation, current = state.generation, "Discarding superseded snapshot");
            return;
        }

        let mut view = ReconciledView::from_snapshot(&snapshot);
        let replayed = state.pending.len();
        for (delta, at) in state.pending.drain(..) {
            view.apply(&delta, at);
            metrics::increment_deltas_applied();
        }
        metrics::set_deltas_buffered(0);

        state.view = Some(view.clone());
        state.phase = EnginePhase::Live;
        state.last_fetch_error = None;
        self.view_tx.send_replace(ViewStatus::Live(view));
        info!(
            period = %self.period,
            generation,
            total_streams = snapshot.total_streams,
            replayed,
            "Snapshot installed"
        );
    }

    fn fetch_failed(&self, generation: u64, err: FetchError) {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return;
        }
        warn!(
            period = %self.period,
            generation,
            error = %err,
            retry_in_ms = self.settings.retry_interval.as_millis() as u64,
            "Snapshot fetch failed, serving last good view"
        );
        state.last_fetch_error = Some(err);
        self.publish_stale(&state);
    }

    fn on_delta(&self, event: &DeltaEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let delta: GlobalDelta = match event.decode() {
            Ok(delta) => delta,
            Err(err) => {
                metrics::increment_decode_errors("global");
                warn!(error = %err, sequence = event.sequence, "Dropping malformed global delta");
                return;
            }
        };

        let mut state = lock(&self.state);
        match state.phase {
            EnginePhase::Live => {
                if let Some(view) = state.view.as_mut() {
                    view.apply(&delta, event.received_at);
                    let updated = view.clone();
                    self.view_tx.send_replace(ViewStatus::Live(updated));
                    metrics::increment_deltas_applied();
                }
            }
            EnginePhase::Seeding | EnginePhase::Resyncing => {
                if state.pending.len() >= self.settings.max_pending_deltas {
                    state.pending.pop_front();
                    state.dropped_pending += 1;
                    warn!(
                        limit = self.settings.max_pending_deltas,
                        "Pending delta buffer full, dropping oldest"
                    );
                }
                state.pending.push_back((delta, event.received_at));
                metrics::set_deltas_buffered(state.pending.len());
            }
        }
    }

    fn on_state(self: &Arc<Self>, connection: ConnectionState) {
        match connection {
            ConnectionState::Connected => {
                self.live_updates.store(true, Ordering::Release);
                self.begin_fetch(true, "channel connected");
            }
            ConnectionState::Error => {
                self.live_updates.store(false, Ordering::Release);
                self.publish_stale(&lock(&self.state));
            }
            ConnectionState::Disconnected => {
                self.publish_stale(&lock(&self.state));
            }
            ConnectionState::Connecting => {}
        }
    }
}

/// Pull until one attempt of `generation` succeeds or it is superseded.
///
/// The pull itself is never aborted; its result is dropped if the engine is
/// gone by the time it lands.
async fn fetch_loop(
    engine: Weak<EngineInner>,
    source: Arc<dyn SnapshotSource>,
    period: Period,
    generation: u64,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let span = create_fetch_span(period, generation);
        let mut timer = FetchTimer::new(period);
        let result = source.fetch(period).instrument(span).await;
        if result.is_ok() {
            timer.succeeded();
        }
        drop(timer);

        let Some(inner) = engine.upgrade() else {
            debug!(%period, generation, "Engine dropped, discarding snapshot result");
            return;
        };
        if !inner.is_current(generation) {
            debug!(%period, generation, "Fetch superseded, discarding result");
            return;
        }

        match result {
            Ok(snapshot) => {
                inner.cache.store(snapshot.clone());
                inner.install(generation, snapshot);
                return;
            }
            Err(err) => inner.fetch_failed(generation, err),
        }
        drop(inner);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

async fn refresh_loop(engine: Weak<EngineInner>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match engine.upgrade() {
            Some(inner) => inner.begin_fetch(true, "periodic refresh"),
            None => return,
        }
    }
}

/// Reconciles one period's snapshot with the live delta stream.
///
/// Torn down by [`ReconciliationEngine::stop`] or on drop. Switching period
/// means starting a new engine.
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("period", &self.inner.period)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ReconciliationEngine {
    /// Start reconciling `period` against `manager`'s delta stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        period: Period,
        manager: &ConnectionManager,
        source: Arc<dyn SnapshotSource>,
        cache: Arc<SnapshotCache>,
        settings: ReconcileSettings,
    ) -> Self {
        let (view_tx, _) = watch::channel(ViewStatus::Loading);
        let refresh_interval = settings.refresh_interval;
        let inner = Arc::new(EngineInner {
            period,
            source,
            cache,
            settings,
            state: Mutex::new(EngineState {
                phase: EnginePhase::Seeding,
                view: None,
                generation: 0,
                pending: VecDeque::new(),
                dropped_pending: 0,
                last_fetch_error: None,
            }),
            view_tx,
            live_updates: AtomicBool::new(manager.state() != ConnectionState::Error),
            cancel: CancellationToken::new(),
            runtime: Handle::current(),
        });

        let on_delta = Arc::downgrade(&inner);
        let delta_sub = manager.subscribe(METRICS_UPDATE, move |event| {
            if let Some(inner) = on_delta.upgrade() {
                inner.on_delta(event);
            }
        });
        let on_state = Arc::downgrade(&inner);
        let state_sub = manager.on_state_change(move |state| {
            if let Some(inner) = on_state.upgrade() {
                inner.on_state(state);
            }
        });

        info!(%period, channel = %manager.state(), "Starting reconciliation engine");
        inner.begin_fetch(false, "initial seed");

        if let Some(every) = refresh_interval {
            inner.runtime.spawn(refresh_loop(
                Arc::downgrade(&inner),
                every,
                inner.cancel.clone(),
            ));
        }

        Self {
            inner,
            subscriptions: Mutex::new(vec![delta_sub, state_sub]),
        }
    }

    /// Force a resync from the snapshot endpoint.
    pub fn refresh(&self) {
        self.inner.begin_fetch(true, "manual refresh");
    }

    pub fn current(&self) -> ViewStatus {
        self.inner.view_tx.borrow().clone()
    }

    /// Receiver of every published view status
    pub fn watch(&self) -> watch::Receiver<ViewStatus> {
        self.inner.view_tx.subscribe()
    }

    /// False while the push channel is in `error`; pulls continue regardless.
    pub fn live_updates_available(&self) -> bool {
        self.inner.live_updates.load(Ordering::Acquire)
    }

    pub fn period(&self) -> Period {
        self.inner.period
    }

    pub fn phase(&self) -> EnginePhase {
        lock(&self.inner.state).phase
    }

    /// Deltas currently held back for an in-flight fetch
    pub fn pending_deltas(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Buffered deltas dropped because the buffer was full
    pub fn dropped_deltas(&self) -> u64 {
        lock(&self.inner.state).dropped_pending
    }

    pub fn last_fetch_error(&self) -> Option<FetchError> {
        lock(&self.inner.state).last_fetch_error.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Unsubscribe and cancel background work. Idempotent.
    pub fn stop(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        debug!(period = %self.inner.period, "Reconciliation engine stopped");
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        adapters::memory::{MemorySnapshotSource, MemoryTransport},
        core::backoff::BackoffPolicy,
        ports::push_channel::PushTransport,
    };

    fn settings() -> ReconcileSettings {
        ReconcileSettings {
            freshness_window: Duration::from_secs(60),
            retry_interval: Duration::from_millis(10),
            refresh_interval: None,
            max_pending_deltas: 100,
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(MemoryTransport::new()) as Arc<dyn PushTransport>,
            BackoffPolicy::default(),
        )
    }

    fn delta_event(requests: u64, avg_latency: f64) -> DeltaEvent {
        DeltaEvent::new(
            METRICS_UPDATE,
            json!({"requests": requests, "bytes": 0, "avg_latency": avg_latency}),
        )
    }

    async fn wait_for(engine: &ReconciliationEngine, predicate: impl FnMut(&ViewStatus) -> bool) -> ViewStatus {
        let mut rx = engine.watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
            .await
            .expect("view status not reached in time")
            .expect("engine dropped")
            .clone()
    }

    #[tokio::test]
    async fn test_seeds_from_fresh_cache_without_pull() {
        let cache = Arc::new(SnapshotCache::new());
        cache.store(Snapshot::new(Period::Last30Days, 10, 0, 50.0, 80.0));
        let source = Arc::new(MemorySnapshotSource::new());

        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager(),
            source.clone(),
            cache,
            settings(),
        );

        assert!(engine.current().is_live());
        assert_eq!(engine.current().view().unwrap().total_streams, 10);
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_resync_invalidates_cache() {
        let cache = Arc::new(SnapshotCache::new());
        cache.store(Snapshot::new(Period::Last30Days, 10, 0, 50.0, 80.0));
        let source = Arc::new(MemorySnapshotSource::new());
        source.pause();
        let manager = manager();

        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager,
            source.clone(),
            Arc::clone(&cache),
            settings(),
        );
        assert!(engine.current().is_live());

        engine.refresh();
        assert!(cache.fresh(Period::Last30Days, Duration::from_secs(60)).is_none());
        assert!(matches!(engine.current(), ViewStatus::Stale(_)));

        // A later engine for the same period pulls instead of reusing the old entry
        let second = ReconciliationEngine::start(
            Period::Last30Days,
            &manager,
            source.clone(),
            cache,
            settings(),
        );
        assert!(second.current().is_loading());
        assert_eq!(second.phase(), EnginePhase::Seeding);
    }

    #[tokio::test]
    async fn test_loading_until_first_snapshot() {
        let source = Arc::new(MemorySnapshotSource::with_snapshot(Snapshot::new(
            Period::Last7Days,
            4,
            0,
            10.0,
            20.0,
        )));
        source.pause();

        let engine = ReconciliationEngine::start(
            Period::Last7Days,
            &manager(),
            source.clone(),
            Arc::new(SnapshotCache::new()),
            settings(),
        );
        assert!(engine.current().is_loading());
        assert_eq!(engine.phase(), EnginePhase::Seeding);

        source.resume();
        let status = wait_for(&engine, ViewStatus::is_live).await;
        assert_eq!(status.view().unwrap().total_streams, 4);
    }

    #[tokio::test]
    async fn test_deltas_buffered_while_seeding() {
        let manager = manager();
        let source = Arc::new(MemorySnapshotSource::with_snapshot(Snapshot::new(
            Period::Last30Days,
            100,
            0,
            200.0,
            900.0,
        )));
        source.pause();
        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager,
            source.clone(),
            Arc::new(SnapshotCache::new()),
            settings(),
        );

        manager.registry().dispatch(&delta_event(50, 500.0));
        assert_eq!(engine.pending_deltas(), 1);
        assert!(engine.current().is_loading());

        source.resume();
        let status = wait_for(&engine, ViewStatus::is_live).await;
        let view = status.view().unwrap();
        assert_eq!(view.total_streams, 150);
        assert!((view.avg_duration_ms - 300.0).abs() < 1e-9);
        assert_eq!(engine.pending_deltas(), 0);
    }

    #[tokio::test]
    async fn test_pending_buffer_drops_oldest() {
        let manager = manager();
        let source = Arc::new(MemorySnapshotSource::with_snapshot(Snapshot::new(
            Period::Last30Days,
            0,
            0,
            0.0,
            0.0,
        )));
        source.pause();
        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager,
            source.clone(),
            Arc::new(SnapshotCache::new()),
            ReconcileSettings {
                max_pending_deltas: 2,
                ..settings()
            },
        );

        manager.registry().dispatch(&delta_event(1, 1_000.0));
        manager.registry().dispatch(&delta_event(2, 10.0));
        manager.registry().dispatch(&delta_event(2, 20.0));
        assert_eq!(engine.pending_deltas(), 2);
        assert_eq!(engine.dropped_deltas(), 1);

        source.resume();
        let status = wait_for(&engine, ViewStatus::is_live).await;
        let view = status.view().unwrap();
        assert_eq!(view.total_streams, 4);
        assert!((view.avg_duration_ms - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fetch_failure_retries_and_keeps_last_view() {
        let source = Arc::new(MemorySnapshotSource::with_snapshot(Snapshot::new(
            Period::Last30Days,
            7,
            0,
            1.0,
            1.0,
        )));
        source.push_response(Err(FetchError::Transport("503".to_string())));

        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager(),
            source.clone(),
            Arc::new(SnapshotCache::new()),
            settings(),
        );
        let status = wait_for(&engine, ViewStatus::is_live).await;
        assert_eq!(status.view().unwrap().total_streams, 7);
        assert_eq!(source.fetch_count(), 2);

        source.push_response(Err(FetchError::Decode("bad body".to_string())));
        source.pause();
        engine.refresh();
        assert!(matches!(engine.current(), ViewStatus::Stale(_)));
        source.resume();

        // One failed pull, then the retry succeeds
        let status = wait_for(&engine, ViewStatus::is_live).await;
        assert_eq!(status.view().unwrap().total_streams, 7);
        assert_eq!(source.completed_count(), 4);
        assert!(engine.last_fetch_error().is_none());
    }

    #[tokio::test]
    async fn test_malformed_delta_is_ignored() {
        let manager = manager();
        let cache = Arc::new(SnapshotCache::new());
        cache.store(Snapshot::new(Period::Last30Days, 10, 0, 50.0, 80.0));
        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager,
            Arc::new(MemorySnapshotSource::new()),
            cache,
            settings(),
        );

        manager
            .registry()
            .dispatch(&DeltaEvent::new(METRICS_UPDATE, json!({"requests": "many"})));
        manager.registry().dispatch(&delta_event(10, 150.0));

        let view = engine.current().view().cloned().unwrap();
        assert_eq!(view.total_streams, 20);
        assert!((view.avg_duration_ms - 100.0).abs() < 1e-9);
        assert_eq!(view.deltas_applied, 1);
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_and_discards_in_flight_fetch() {
        let manager = manager();
        let source = Arc::new(MemorySnapshotSource::with_snapshot(Snapshot::new(
            Period::Last30Days,
            1,
            0,
            1.0,
            1.0,
        )));
        source.pause();
        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager,
            source.clone(),
            Arc::new(SnapshotCache::new()),
            settings(),
        );
        assert_eq!(manager.registry().subscriber_count(METRICS_UPDATE), 1);

        engine.stop();
        engine.stop();
        assert!(engine.is_stopped());
        assert_eq!(manager.registry().subscriber_count(METRICS_UPDATE), 0);
        assert_eq!(manager.registry().state_listener_count(), 0);

        source.resume();
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.completed_count() < 1 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.current().is_loading());
    }

    #[tokio::test]
    async fn test_drop_tears_down() {
        let manager = manager();
        let engine = ReconciliationEngine::start(
            Period::Last24Hours,
            &manager,
            Arc::new(MemorySnapshotSource::new()),
            Arc::new(SnapshotCache::new()),
            settings(),
        );
        drop(engine);

        assert_eq!(manager.registry().subscriber_count(METRICS_UPDATE), 0);
    }

    #[tokio::test]
    async fn test_periodic_refresh_pulls_again() {
        let source = Arc::new(MemorySnapshotSource::with_snapshot(Snapshot::new(
            Period::Last30Days,
            1,
            0,
            1.0,
            1.0,
        )));
        let engine = ReconciliationEngine::start(
            Period::Last30Days,
            &manager(),
            source.clone(),
            Arc::new(SnapshotCache::new()),
            ReconcileSettings {
                refresh_interval: Some(Duration::from_millis(20)),
                ..settings()
            },
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while source.fetch_count() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        engine.stop();
    }
}
