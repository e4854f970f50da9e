//! Operational counters for one input.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Which kind of cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Full synchronization.
    Sync,
    /// Incremental update.
    Update,
}

impl CycleKind {
    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Update => "update",
        }
    }
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronization metrics, monotonic since startup unless noted.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Full synchronizations started.
    pub sync_total: AtomicU64,
    /// Full synchronizations that failed.
    pub sync_errors: AtomicU64,
    /// Incremental updates started.
    pub update_total: AtomicU64,
    /// Incremental updates that failed.
    pub update_errors: AtomicU64,
    /// Cycle panics caught and converted to errors.
    pub panics_recovered: AtomicU64,
    /// Asset and marker events handed to the pipeline.
    pub events_published: AtomicU64,
    /// Events the pipeline acknowledged before their cycle committed.
    pub events_acked: AtomicU64,
    /// Assets classified as discovered, modified or deleted.
    pub assets_changed: AtomicU64,
    /// Duration of the most recent cycle in milliseconds (gauge).
    pub last_cycle_millis: AtomicU64,
    /// Unix time of the last committed full synchronization (gauge).
    pub last_sync_timestamp: AtomicU64,
    /// Unix time of the last committed incremental update (gauge).
    pub last_update_timestamp: AtomicU64,
}

impl SyncMetrics {
    /// Count a cycle start.
    pub fn cycle_started(&self, kind: CycleKind) {
        match kind {
            CycleKind::Sync => self.sync_total.fetch_add(1, Ordering::Relaxed),
            CycleKind::Update => self.update_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Count a cycle failure.
    pub fn cycle_failed(&self, kind: CycleKind) {
        match kind {
            CycleKind::Sync => self.sync_errors.fetch_add(1, Ordering::Relaxed),
            CycleKind::Update => self.update_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a committed cycle.
    pub fn cycle_committed(&self, kind: CycleKind, at: DateTime<Utc>) {
        let secs = u64::try_from(at.timestamp()).unwrap_or(0);
        match kind {
            CycleKind::Sync => self.last_sync_timestamp.store(secs, Ordering::Relaxed),
            CycleKind::Update => self.last_update_timestamp.store(secs, Ordering::Relaxed),
        }
    }

    /// Record how long the last cycle took, successful or not.
    pub fn cycle_duration(&self, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.last_cycle_millis.store(millis, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn counters_split_by_cycle_kind() {
        let m = SyncMetrics::default();
        m.cycle_started(CycleKind::Sync);
        m.cycle_started(CycleKind::Update);
        m.cycle_started(CycleKind::Update);
        m.cycle_failed(CycleKind::Update);

        assert_eq!(SyncMetrics::get(&m.sync_total), 1);
        assert_eq!(SyncMetrics::get(&m.update_total), 2);
        assert_eq!(SyncMetrics::get(&m.update_errors), 1);
        assert_eq!(SyncMetrics::get(&m.sync_errors), 0);
    }

    #[test]
    fn commit_times_are_unix_seconds() {
        let m = SyncMetrics::default();
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        m.cycle_committed(CycleKind::Sync, at);
        assert_eq!(SyncMetrics::get(&m.last_sync_timestamp), 1_767_225_600);
        assert_eq!(SyncMetrics::get(&m.last_update_timestamp), 0);
    }
}
