//! Timer-driven synchronization loop for one input.
//!
//! Two timers drive the loop. The sync timer runs a full synchronization:
//! complete enumeration, reconciliation (including deletion-by-absence for
//! sources without deletion signals), then a started marker, every known
//! asset and a completed marker. The update timer runs an incremental
//! update that publishes only what changed. A full sync also restarts the
//! update timer, so updates count from the most recent full sync.
//!
//! Both timers are seeded from the persisted cursors, so a restarted process
//! keeps its cadence. Each cycle commits only after every published event
//! has been acknowledged; a failed, cancelled or panicking cycle rolls back
//! and leaves the cursors where they were.

use crate::config::SyncConfig;
use crate::error::{CycleError, EngineError, ProviderError};
use crate::metrics::{CycleKind, SyncMetrics};
use crate::panic;
use crate::provider::{FetchContext, Provider};
use crate::publish::Publisher;
use crate::ratelimit::AdaptiveRateLimiter;
use crate::statestore::{self, StateStore};
use crate::storage::Store;
use crate::tracker::{TxTracker, WaitOutcome};
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use idsync_types::{AssetId, AssetKind, Event, Marker, ResumeTokens, Set, SyncCursors};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};
use tokio_util::sync::CancellationToken;

/// Summary of a committed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Which cycle ran.
    pub kind: CycleKind,
    /// Records returned by the provider.
    pub fetched: usize,
    /// Assets classified as discovered, modified or deleted.
    pub changed: usize,
    /// Events published, markers included.
    pub published: usize,
}

/// One configured input: a provider bound to its store and pipeline.
pub struct SyncInput {
    input_id: String,
    provider: Arc<dyn Provider>,
    store: Store,
    publisher: Arc<dyn Publisher>,
    limiter: Arc<AdaptiveRateLimiter>,
    metrics: Arc<SyncMetrics>,
    sync_interval: Duration,
    update_interval: Duration,
}

impl std::fmt::Debug for SyncInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncInput")
            .field("input_id", &self.input_id)
            .field("provider", &self.provider.name())
            .field("store", &self.store)
            .field("sync_interval", &self.sync_interval)
            .field("update_interval", &self.update_interval)
            .finish_non_exhaustive()
    }
}

impl SyncInput {
    /// Create an input.
    pub fn new(
        input_id: impl Into<String>,
        provider: Arc<dyn Provider>,
        store: Store,
        publisher: Arc<dyn Publisher>,
        sync: &SyncConfig,
    ) -> Self {
        Self {
            input_id: input_id.into(),
            provider,
            store,
            publisher,
            limiter: Arc::new(AdaptiveRateLimiter::new(Duration::from_secs(60), None)),
            metrics: Arc::new(SyncMetrics::default()),
            sync_interval: sync.sync_interval(),
            update_interval: sync.update_interval(),
        }
    }

    /// Use a shared rate limiter.
    pub fn with_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Report into shared metrics.
    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Input id.
    pub fn input_id(&self) -> &str {
        &self.input_id
    }

    /// Counters for this input.
    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cycle failures are logged and counted and never end the loop; only
    /// failing to read the initial cursors does.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        panic::install_hook();

        let cursors = statestore::load_cursors(&self.store).await?;
        let mut timers =
            CycleTimers::seeded(&cursors, self.sync_interval, self.update_interval, Utc::now());
        tracing::info!(
            "Input {} ({}) started: full sync in {:?}, update in {:?}",
            self.input_id,
            self.provider.name(),
            timers.sync_due().saturating_duration_since(Instant::now()),
            timers.update_due().saturating_duration_since(Instant::now())
        );

        loop {
            let kind = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Input {} stopped", self.input_id);
                    return Ok(());
                }
                kind = timers.next() => kind,
            };
            let _ = match kind {
                CycleKind::Sync => self.sync_once(&shutdown).await,
                CycleKind::Update => self.update_once(&shutdown).await,
            };
            timers.completed(kind);
        }
    }

    /// Run one full synchronization now.
    pub async fn sync_once(&self, shutdown: &CancellationToken) -> Result<CycleReport, CycleError> {
        self.run_cycle(CycleKind::Sync, self.full_sync(shutdown).boxed())
            .await
    }

    /// Run one incremental update now.
    pub async fn update_once(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        self.run_cycle(CycleKind::Update, self.incremental_update(shutdown).boxed())
            .await
    }

    async fn run_cycle(
        &self,
        kind: CycleKind,
        cycle: BoxFuture<'_, Result<CycleReport, CycleError>>,
    ) -> Result<CycleReport, CycleError> {
        panic::install_hook();
        self.metrics.cycle_started(kind);
        let started = std::time::Instant::now();
        tracing::info!("Starting {} for input {}", kind, self.input_id);

        let result = match AssertUnwindSafe(cycle).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                self.metrics.panics_recovered.fetch_add(1, Ordering::Relaxed);
                Err(panic::into_cycle_error(payload))
            }
        };

        let elapsed = started.elapsed();
        self.metrics.cycle_duration(elapsed);
        match &result {
            Ok(report) => {
                self.metrics.cycle_committed(kind, Utc::now());
                self.metrics
                    .assets_changed
                    .fetch_add(report.changed as u64, Ordering::Relaxed);
                tracing::info!(
                    "Finished {} for input {} in {:?}: fetched={} changed={} published={}",
                    kind,
                    self.input_id,
                    elapsed,
                    report.fetched,
                    report.changed,
                    report.published
                );
            }
            Err(CycleError::Cancelled) => {
                tracing::info!("{} for input {} cancelled", kind, self.input_id);
            }
            Err(e) => {
                self.metrics.cycle_failed(kind);
                tracing::error!("{} for input {} failed: {}", kind, self.input_id, e);
            }
        }
        result
    }

    async fn full_sync(&self, shutdown: &CancellationToken) -> Result<CycleReport, CycleError> {
        let mut state = StateStore::open(&self.store).await?;
        let result = self.full_sync_in(&mut state, shutdown).await;
        finish(state, result).await
    }

    async fn full_sync_in(
        &self,
        state: &mut StateStore,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let purged = state.purge_deleted();
        if purged > 0 {
            tracing::debug!("Purged {} deleted assets", purged);
        }

        let batch = self.fetch(shutdown, &ResumeTokens::new()).await?;
        let fetched = batch.assets.len();

        let mut seen: BTreeMap<AssetKind, Set<AssetId>> = BTreeMap::new();
        for asset in batch.assets {
            seen.entry(asset.kind).or_default().add(asset.id.clone());
            state.store(asset);
        }

        // The enumeration completed, so anything it didn't return is gone.
        if !self.provider.reports_deletions() {
            let now = Utc::now();
            let none = Set::new();
            for &kind in self.provider.kinds() {
                let deleted =
                    state.mark_absent_deleted(kind, seen.get(&kind).unwrap_or(&none), now);
                if !deleted.is_empty() {
                    tracing::debug!("{} {} assets no longer enumerated", deleted.len(), kind);
                }
            }
        }
        state.expand_memberships();

        let changed = state.changed_assets().len();
        let now = Utc::now();
        let mut events = vec![Event::marker(Marker::Started, &self.input_id, now)];
        events.extend(
            state
                .publishable_assets()
                .into_iter()
                .map(|a| Event::asset(self.provider.namespace(), &self.input_id, a, now)),
        );
        let published = self.publish_all(events, shutdown, true).await?;

        let cursors = state.cursors_mut();
        cursors.tokens = batch.tokens;
        cursors.last_sync = Some(Utc::now());

        Ok(CycleReport {
            kind: CycleKind::Sync,
            fetched,
            changed,
            published,
        })
    }

    async fn incremental_update(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let mut state = StateStore::open(&self.store).await?;
        let result = self.incremental_update_in(&mut state, shutdown).await;
        finish(state, result).await
    }

    async fn incremental_update_in(
        &self,
        state: &mut StateStore,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let tokens = state.cursors().tokens.clone();
        let batch = self.fetch(shutdown, &tokens).await?;
        let fetched = batch.assets.len();

        for asset in batch.assets {
            state.store(asset);
        }
        state.expand_memberships();

        let now = Utc::now();
        let events: Vec<Event> = state
            .changed_assets()
            .into_iter()
            .map(|a| Event::asset(self.provider.namespace(), &self.input_id, a, now))
            .collect();
        let changed = events.len();
        let published = self.publish_all(events, shutdown, false).await?;

        let cursors = state.cursors_mut();
        cursors.tokens = batch.tokens;
        cursors.last_update = Some(Utc::now());

        Ok(CycleReport {
            kind: CycleKind::Update,
            fetched,
            changed,
            published,
        })
    }

    async fn fetch(
        &self,
        shutdown: &CancellationToken,
        tokens: &ResumeTokens,
    ) -> Result<crate::provider::FetchBatch, CycleError> {
        let ctx = FetchContext {
            cancel: shutdown,
            limiter: &self.limiter,
        };
        self.provider.fetch(ctx, tokens).await.map_err(|e: ProviderError| {
            if e.is_cancelled() {
                CycleError::Cancelled
            } else {
                CycleError::Provider(e)
            }
        })
    }

    /// Publish `events`, closing with a completed marker when `markers` is
    /// set, then wait for every acknowledgement.
    async fn publish_all(
        &self,
        events: Vec<Event>,
        shutdown: &CancellationToken,
        markers: bool,
    ) -> Result<usize, CycleError> {
        let tracker = TxTracker::new(shutdown.child_token());
        let mut published = 0;
        let result = async {
            for event in events {
                self.publish_one(event, &tracker, shutdown).await?;
                published += 1;
            }
            if markers {
                let end = Event::marker(Marker::Completed, &self.input_id, Utc::now());
                self.publish_one(end, &tracker, shutdown).await?;
                published += 1;
            }
            Ok::<(), CycleError>(())
        }
        .await;
        self.metrics
            .events_published
            .fetch_add(published as u64, Ordering::Relaxed);
        if let Err(e) = result {
            if matches!(e, CycleError::Cancelled) {
                tracing::warn!(
                    "Input {}: pipeline still busy at shutdown after {} events",
                    self.input_id,
                    published
                );
            }
            return Err(e);
        }

        match tracker.wait().await {
            WaitOutcome::Drained => {
                self.metrics
                    .events_acked
                    .fetch_add(published as u64, Ordering::Relaxed);
                Ok(published)
            }
            WaitOutcome::Cancelled { pending } => {
                tracing::warn!(
                    "Input {}: {} events unacknowledged at shutdown",
                    self.input_id,
                    pending
                );
                Err(CycleError::Cancelled)
            }
        }
    }

    /// Hand one event over, giving up if shutdown is requested while the
    /// pipeline is applying backpressure.
    async fn publish_one(
        &self,
        event: Event,
        tracker: &TxTracker,
        shutdown: &CancellationToken,
    ) -> Result<(), CycleError> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(CycleError::Cancelled),
            result = self.publisher.publish(event, tracker.add()) => result.map_err(CycleError::from),
        }
    }
}

/// The sync and update timers of one input.
///
/// Both are seeded from the persisted cursors. A completed full sync
/// restarts both, so updates count from the most recent full sync.
struct CycleTimers {
    sync: Pin<Box<Sleep>>,
    update: Pin<Box<Sleep>>,
    sync_interval: Duration,
    update_interval: Duration,
}

impl CycleTimers {
    fn seeded(
        cursors: &SyncCursors,
        sync_interval: Duration,
        update_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let last_update = cursors.last_update.max(cursors.last_sync);
        let sync_in = first_delay(cursors.last_sync, sync_interval, now);
        let update_in = first_delay(last_update, update_interval, now);
        Self {
            sync: Box::pin(sleep(sync_in)),
            update: Box::pin(sleep(update_in)),
            sync_interval,
            update_interval,
        }
    }

    fn sync_due(&self) -> Instant {
        self.sync.deadline()
    }

    fn update_due(&self) -> Instant {
        self.update.deadline()
    }

    /// Wait for the next cycle. A full sync wins when both are due.
    async fn next(&mut self) -> CycleKind {
        tokio::select! {
            biased;
            _ = self.sync.as_mut() => CycleKind::Sync,
            _ = self.update.as_mut() => CycleKind::Update,
        }
    }

    /// Re-arm after a cycle of `kind` ran, whatever its outcome.
    fn completed(&mut self, kind: CycleKind) {
        let now = Instant::now();
        if kind == CycleKind::Sync {
            self.sync.as_mut().reset(now + self.sync_interval);
        }
        self.update.as_mut().reset(now + self.update_interval);
    }
}

/// Commit on success, roll back otherwise.
async fn finish(
    mut state: StateStore,
    result: Result<CycleReport, CycleError>,
) -> Result<CycleReport, CycleError> {
    match result {
        Ok(report) => {
            state.close(true).await?;
            Ok(report)
        }
        Err(e) => {
            if let Err(rb) = state.close(false).await {
                tracing::error!("Failed to roll back cycle: {}", rb);
            }
            Err(e)
        }
    }
}

/// Time until `last + interval`, zero if overdue or never run, at most
/// `interval`.
fn first_delay(last: Option<DateTime<Utc>>, interval: Duration, now: DateTime<Utc>) -> Duration {
    let Some(last) = last else {
        return Duration::ZERO;
    };
    TimeDelta::from_std(interval)
        .ok()
        .and_then(|step| last.checked_add_signed(step))
        .and_then(|due| (due - now).to_std().ok())
        .map_or(Duration::ZERO, |d| d.min(interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn never_run_fires_immediately() {
        assert_eq!(
            first_delay(None, Duration::from_secs(900), t0()),
            Duration::ZERO
        );
    }

    #[test]
    fn resumes_original_cadence() {
        let last = t0() - TimeDelta::seconds(600);
        assert_eq!(
            first_delay(Some(last), Duration::from_secs(900), t0()),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn overdue_fires_immediately() {
        let last = t0() - TimeDelta::hours(2);
        assert_eq!(
            first_delay(Some(last), Duration::from_secs(900), t0()),
            Duration::ZERO
        );
    }

    const SYNC: Duration = Duration::from_secs(3600);
    const UPDATE: Duration = Duration::from_secs(60);

    fn cursors(last_sync: Option<DateTime<Utc>>, last_update: Option<DateTime<Utc>>) -> SyncCursors {
        SyncCursors {
            last_sync,
            last_update,
            ..SyncCursors::default()
        }
    }

    fn assert_at(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "fired after {elapsed:?}, expected {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_start_runs_full_sync_before_update() {
        let mut timers = CycleTimers::seeded(&SyncCursors::default(), SYNC, UPDATE, t0());
        let start = Instant::now();
        assert_eq!(timers.next().await, CycleKind::Sync);
        assert_at(start, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_fire_on_their_own_interval_between_syncs() {
        let mut timers = CycleTimers::seeded(&SyncCursors::default(), SYNC, UPDATE, t0());
        let start = Instant::now();
        assert_eq!(timers.next().await, CycleKind::Sync);
        timers.completed(CycleKind::Sync);

        for i in 1..=3 {
            assert_eq!(timers.next().await, CycleKind::Update);
            assert_at(start, UPDATE * i);
            timers.completed(CycleKind::Update);
        }
        assert_at(start, UPDATE * 3);
        assert_eq!(timers.sync_due() - start, SYNC);
    }

    #[tokio::test(start_paused = true)]
    async fn full_sync_restarts_update_countdown() {
        // Full sync due in 10s, update due in 30s.
        let now = t0();
        let seeded = cursors(
            Some(now - TimeDelta::seconds(3590)),
            Some(now - TimeDelta::seconds(30)),
        );
        let mut timers = CycleTimers::seeded(&seeded, SYNC, UPDATE, now);
        let start = Instant::now();

        assert_eq!(timers.next().await, CycleKind::Sync);
        assert_at(start, Duration::from_secs(10));
        timers.completed(CycleKind::Sync);

        // Not at 30s: the update waits a whole interval after the sync.
        assert_eq!(timers.next().await, CycleKind::Update);
        assert_at(start, Duration::from_secs(70));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resumes_persisted_cadence() {
        // Last full sync 20 minutes ago, last update 50 seconds ago.
        let now = t0();
        let seeded = cursors(
            Some(now - TimeDelta::minutes(20)),
            Some(now - TimeDelta::seconds(50)),
        );
        let mut timers = CycleTimers::seeded(&seeded, SYNC, UPDATE, now);
        let start = Instant::now();
        assert_eq!(timers.sync_due() - start, Duration::from_secs(40 * 60));

        assert_eq!(timers.next().await, CycleKind::Update);
        assert_at(start, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn update_countdown_starts_from_newer_full_sync() {
        let now = t0();
        let seeded = cursors(
            Some(now - TimeDelta::seconds(10)),
            Some(now - TimeDelta::seconds(3000)),
        );
        let mut timers = CycleTimers::seeded(&seeded, SYNC, UPDATE, now);
        let start = Instant::now();

        assert_eq!(timers.next().await, CycleKind::Update);
        assert_at(start, Duration::from_secs(50));
    }

    #[test]
    fn future_cursor_is_capped_at_interval() {
        let last = t0() + TimeDelta::hours(5);
        assert_eq!(
            first_delay(Some(last), Duration::from_secs(900), t0()),
            Duration::from_secs(900)
        );
    }
}
