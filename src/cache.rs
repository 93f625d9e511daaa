// ============================================================================
// SECTION 7: SNAPSHOT CACHE ENGINE
// ============================================================================
// One cache per domain:
// - Readers load the current view without locking
// - A single writer computes the next snapshot under a deadline
// - Commit is one pointer swap; failure keeps the previous snapshot
// ============================================================================

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, trace};

use crate::error::{ExporterError, ExporterResult, SkipReason};
use crate::logging::PerfTimer;
use crate::types::{MetricRecord, Timestamp};

// ----------------------------------------------------------------------------
// 7.1 Snapshot
// ----------------------------------------------------------------------------

/// Immutable result of one committed refresh cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Monotonic per-domain commit counter; `0` before the first commit.
    pub version: u64,
    /// Records in emission order (sorted by entity identifier).
    pub records: Vec<MetricRecord>,
    pub generated_at: Option<Timestamp>,
    pub skipped: u64,
    pub skipped_by_reason: BTreeMap<SkipReason, u64>,
    pub truncated: bool,
    /// Freshness of the upstream data itself, when the source reports one.
    pub source_updated_at: Option<Timestamp>,
    pub duration_seconds: f64,
}

impl Snapshot {
    /// The value served before any refresh succeeds.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the uncommitted part of a snapshot. Version, generation time
    /// and duration are stamped by the cache on commit.
    pub fn from_parts(
        records: Vec<MetricRecord>,
        skipped_by_reason: BTreeMap<SkipReason, u64>,
        truncated: bool,
        source_updated_at: Option<Timestamp>,
    ) -> Self {
        let skipped = skipped_by_reason.values().sum();
        Self {
            records,
            skipped,
            skipped_by_reason,
            truncated,
            source_updated_at,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Records with the given metric name, in snapshot order.
    pub fn find<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetricRecord> + 'a {
        self.records.iter().filter(move |r| r.name == name)
    }

    /// Value of the first record named `name` whose labels include every
    /// `(key, value)` pair in `labels`.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.find(name)
            .find(|r| labels.iter().all(|(k, v)| r.label(k) == Some(*v)))
            .map(|r| r.value)
    }

    pub fn skipped_for(&self, reason: SkipReason) -> u64 {
        self.skipped_by_reason.get(&reason).copied().unwrap_or(0)
    }

    /// Text rendering of the records alone.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.records.len() * 64);
        for record in &self.records {
            record.render(&mut out);
        }
        out
    }

    /// Hash of the rendered records, equal for byte-identical snapshots.
    pub fn fingerprint(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.render().as_bytes())
    }
}

// ----------------------------------------------------------------------------
// 7.2 Health Record
// ----------------------------------------------------------------------------

/// Side-channel outcome of the latest refresh attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthRecord {
    pub success: bool,
    pub duration_seconds: f64,
    pub attempts: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<Timestamp>,
    pub last_success_at: Option<Timestamp>,
}

/// Snapshot and health as committed together.
#[derive(Debug, Clone, Default)]
pub struct CacheView {
    pub snapshot: Arc<Snapshot>,
    pub health: HealthRecord,
}

impl CacheView {
    /// Seconds since the current snapshot was generated; `0` before the
    /// first successful refresh.
    pub fn age_seconds(&self, now: Timestamp) -> f64 {
        match self.snapshot.generated_at {
            Some(at) => now.duration_since(at).as_secs_f64(),
            None => 0.0,
        }
    }
}

// ----------------------------------------------------------------------------
// 7.3 Cycle Phases
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CyclePhase {
    Idle = 0,
    Scanning = 1,
    Joining = 2,
    Bounding = 3,
    Emitting = 4,
    Committed = 5,
    Failed = 6,
}

impl CyclePhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CyclePhase::Scanning,
            2 => CyclePhase::Joining,
            3 => CyclePhase::Bounding,
            4 => CyclePhase::Emitting,
            5 => CyclePhase::Committed,
            6 => CyclePhase::Failed,
            _ => CyclePhase::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Scanning => "scanning",
            CyclePhase::Joining => "joining",
            CyclePhase::Bounding => "bounding",
            CyclePhase::Emitting => "emitting",
            CyclePhase::Committed => "committed",
            CyclePhase::Failed => "failed",
        }
    }
}

/// Shared handle through which a running cycle reports its phase.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    domain: &'static str,
    cell: Arc<AtomicU8>,
}

impl PhaseTracker {
    fn new(domain: &'static str) -> Self {
        Self {
            domain,
            cell: Arc::new(AtomicU8::new(CyclePhase::Idle as u8)),
        }
    }

    /// Detached tracker for running a pipeline outside a cache.
    pub fn detached(domain: &'static str) -> Self {
        Self::new(domain)
    }

    pub fn enter(&self, phase: CyclePhase) {
        self.cell.store(phase as u8, Ordering::Release);
        trace!(target: "sonic::cache", domain = self.domain, phase = phase.as_str(), "Cycle phase");
    }

    pub fn current(&self) -> CyclePhase {
        CyclePhase::from_u8(self.cell.load(Ordering::Acquire))
    }
}

// ----------------------------------------------------------------------------
// 7.4 Snapshot Cache
// ----------------------------------------------------------------------------

/// Versioned snapshot holder for one domain.
#[derive(Debug)]
pub struct SnapshotCache {
    domain: &'static str,
    view: ArcSwap<CacheView>,
    /// Serialises refreshes; readers never take it.
    writer: TokioMutex<()>,
    attempts: AtomicU64,
    phase: PhaseTracker,
}

impl SnapshotCache {
    pub fn new(domain: &'static str) -> Self {
        Self {
            domain,
            view: ArcSwap::from_pointee(CacheView::default()),
            writer: TokioMutex::new(()),
            attempts: AtomicU64::new(0),
            phase: PhaseTracker::new(domain),
        }
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    /// Current snapshot.
    pub fn read(&self) -> Arc<Snapshot> {
        self.view.load().snapshot.clone()
    }

    pub fn health(&self) -> HealthRecord {
        self.view.load().health.clone()
    }

    /// Snapshot and health from the same commit.
    pub fn view(&self) -> Arc<CacheView> {
        self.view.load_full()
    }

    pub fn age_seconds(&self, now: Timestamp) -> f64 {
        self.view.load().age_seconds(now)
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase.current()
    }

    /// Whether the snapshot is older than `freshness` or was never produced.
    pub fn is_stale(&self, freshness: Duration, now: Timestamp) -> bool {
        match self.view.load().snapshot.generated_at {
            Some(at) => now.duration_since(at) > freshness,
            None => true,
        }
    }

    /// Run one refresh cycle.
    ///
    /// The producer is aborted once `timeout` elapses. Any error leaves the
    /// current snapshot in place and is recorded in the health record.
    pub async fn refresh<F, Fut>(&self, timeout: Duration, producer: F) -> ExporterResult<Arc<Snapshot>>
    where
        F: FnOnce(PhaseTracker) -> Fut,
        Fut: Future<Output = ExporterResult<Snapshot>>,
    {
        let _writer = self.writer.lock().await;
        self.run_locked(timeout, producer).await
    }

    /// Refresh only when stale. Callers that queued behind another refresh
    /// observe its outcome instead of starting a second one.
    ///
    /// Returns `true` when this call ran the producer.
    pub async fn refresh_if_stale<F, Fut>(
        &self,
        freshness: Duration,
        timeout: Duration,
        producer: F,
    ) -> ExporterResult<bool>
    where
        F: FnOnce(PhaseTracker) -> Fut,
        Fut: Future<Output = ExporterResult<Snapshot>>,
    {
        let observed = self.attempts.load(Ordering::Acquire);
        if !self.is_stale(freshness, Timestamp::now()) {
            return Ok(false);
        }

        let _writer = self.writer.lock().await;
        if self.attempts.load(Ordering::Acquire) != observed {
            trace!(target: "sonic::cache", domain = self.domain, "Refresh completed while waiting");
            return Ok(false);
        }
        if !self.is_stale(freshness, Timestamp::now()) {
            return Ok(false);
        }

        self.run_locked(timeout, producer).await.map(|_| true)
    }

    async fn run_locked<F, Fut>(&self, timeout: Duration, producer: F) -> ExporterResult<Arc<Snapshot>>
    where
        F: FnOnce(PhaseTracker) -> Fut,
        Fut: Future<Output = ExporterResult<Snapshot>>,
    {
        let started_at = Timestamp::now();
        let timer = PerfTimer::with_threshold("refresh", (timeout.as_millis() / 2) as u64);
        self.phase.enter(CyclePhase::Idle);

        let outcome = match tokio::time::timeout(timeout, producer(self.phase.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ExporterError::deadline(self.domain, timeout.as_millis() as u64)),
        };
        let duration_seconds = timer.stop();
        let attempts = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = self.view.load_full();

        match outcome {
            Ok(mut next) => {
                next.version = previous.snapshot.version + 1;
                next.generated_at = Some(Timestamp::now());
                next.duration_seconds = duration_seconds;
                let snapshot = Arc::new(next);

                self.view.store(Arc::new(CacheView {
                    snapshot: snapshot.clone(),
                    health: HealthRecord {
                        success: true,
                        duration_seconds,
                        attempts,
                        consecutive_failures: 0,
                        last_error: None,
                        last_attempt_at: Some(started_at),
                        last_success_at: snapshot.generated_at,
                    },
                }));
                self.phase.enter(CyclePhase::Committed);

                debug!(
                    target: "sonic::cache",
                    domain = self.domain,
                    version = snapshot.version,
                    records = snapshot.records.len(),
                    skipped = snapshot.skipped,
                    truncated = snapshot.truncated,
                    duration_ms = (duration_seconds * 1000.0) as u64,
                    fingerprint = snapshot.fingerprint(),
                    "Snapshot committed"
                );
                Ok(snapshot)
            }
            Err(e) => {
                let consecutive_failures = previous.health.consecutive_failures + 1;
                self.view.store(Arc::new(CacheView {
                    snapshot: previous.snapshot.clone(),
                    health: HealthRecord {
                        success: false,
                        duration_seconds,
                        attempts,
                        consecutive_failures,
                        last_error: Some(e.to_string()),
                        last_attempt_at: Some(started_at),
                        last_success_at: previous.health.last_success_at,
                    },
                }));
                self.phase.enter(CyclePhase::Failed);

                error!(
                    target: "sonic::cache",
                    domain = self.domain,
                    error = %e,
                    category = e.category(),
                    recoverable = e.is_recoverable(),
                    hint = ?e.recovery_hint(),
                    consecutive_failures,
                    "Refresh failed, keeping previous snapshot"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::types::MetricDescriptor;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn snapshot_of(n: usize) -> Snapshot {
        let desc = MetricDescriptor::gauge("sonic", "test", "value", "Test value", &["id"]);
        let records = (0..n).map(|i| desc.sample(i as f64, &[&format!("e{:03}", i)])).collect();
        Snapshot::from_parts(records, BTreeMap::new(), false, None)
    }

    #[tokio::test]
    async fn test_health_defaults_before_first_refresh() {
        let cache = SnapshotCache::new("vlan");
        let health = cache.health();
        assert!(!health.success);
        assert_eq!(health.duration_seconds, 0.0);
        assert_eq!(cache.age_seconds(Timestamp::now()), 0.0);
        assert!(cache.read().is_empty());
        assert_eq!(cache.phase(), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_stale_on_failure() {
        let cache = SnapshotCache::new("lag");
        let first = cache
            .refresh(Duration::from_secs(1), |_| async { Ok(snapshot_of(3)) })
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let err = cache
            .refresh(Duration::from_secs(1), |_| async {
                Err(SourceError::unavailable("memory://", "down").into())
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), "source");

        let after = cache.read();
        assert_eq!(*after, *first);
        let health = cache.health();
        assert!(!health.success);
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.attempts, 2);
        assert!(health.last_error.unwrap().contains("down"));
        assert_eq!(cache.phase(), CyclePhase::Failed);

        cache
            .refresh(Duration::from_secs(1), |_| async { Ok(snapshot_of(1)) })
            .await
            .unwrap();
        assert!(cache.health().success);
        assert_eq!(cache.health().consecutive_failures, 0);
        assert_eq!(cache.read().version, 2);
    }

    #[tokio::test]
    async fn test_deadline_aborts_producer() {
        let cache = SnapshotCache::new("fdb");
        let err = cache
            .refresh(Duration::from_millis(20), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(snapshot_of(1))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExporterError::DeadlineExceeded { .. }));
        assert_eq!(cache.read().version, 0);
        assert!(!cache.health().success);
    }

    #[tokio::test]
    async fn test_on_demand_refresh_collapses_concurrent_callers() {
        let cache = Arc::new(SnapshotCache::new("lldp"));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .refresh_if_stale(Duration::from_secs(15), Duration::from_secs(1), |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(snapshot_of(2))
                    })
                    .await
                    .unwrap()
            }));
        }
        let refreshed: Vec<bool> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(refreshed.iter().filter(|r| **r).count(), 1);
        assert_eq!(cache.read().len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_not_refreshed() {
        let cache = SnapshotCache::new("docker");
        cache.refresh(Duration::from_secs(1), |_| async { Ok(snapshot_of(1)) }).await.unwrap();
        let refreshed = cache
            .refresh_if_stale(Duration::from_secs(60), Duration::from_secs(1), |_| async {
                Ok(snapshot_of(5))
            })
            .await
            .unwrap();
        assert!(!refreshed);
        assert_eq!(cache.read().len(), 1);
    }

    #[tokio::test]
    async fn test_readers_see_whole_snapshots_during_refresh() {
        let cache = Arc::new(SnapshotCache::new("vlan"));
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let view = cache.view();
                    let snap = &view.snapshot;
                    // version n always carries n * 10 records
                    assert_eq!(snap.records.len() as u64, snap.version * 10);
                    if snap.version > 0 {
                        assert!(view.health.success);
                        assert_eq!(view.health.last_success_at, snap.generated_at);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for n in 1..=20u64 {
            cache
                .refresh(Duration::from_secs(1), move |phase| async move {
                    phase.enter(CyclePhase::Scanning);
                    tokio::task::yield_now().await;
                    phase.enter(CyclePhase::Emitting);
                    Ok(snapshot_of((n * 10) as usize))
                })
                .await
                .unwrap();
        }
        reader.await.unwrap();
        assert_eq!(cache.read().version, 20);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        assert_eq!(snapshot_of(4).fingerprint(), snapshot_of(4).fingerprint());
        assert_ne!(snapshot_of(4).fingerprint(), snapshot_of(5).fingerprint());
        let snap = snapshot_of(2);
        assert_eq!(snap.value("sonic_test_value", &[("id", "e001")]), Some(1.0));
    }
}
