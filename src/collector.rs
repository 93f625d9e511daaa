// ============================================================================
// SECTION 9: DOMAIN COLLECTORS & REGISTRY
// ============================================================================
// Binds one pipeline to its snapshot cache and refresh policy:
// - Interval domains refresh once at start-up, then in a background task
// - On-demand domains refresh inside `collect` once the snapshot is stale
// - `collect` drains the committed snapshot plus health into a sink
// The registry composes the five domains in a fixed order.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{HealthRecord, PhaseTracker, Snapshot, SnapshotCache};
use crate::config::{DomainConfig, ExporterConfig, StoreConfig};
use crate::domains::{DockerPipeline, FdbPipeline, LagPipeline, LldpPipeline, VlanPipeline};
use crate::error::{ExporterResult, SkipReason};
use crate::exposition::{render_text, FamilySink, MetricSink};
use crate::pipeline::{Pipeline, ScrapeContext};
use crate::scheduler::{RefreshPolicy, RefreshTask};
use crate::store::{MemoryStore, RedisStore, SourceStore};
use crate::types::{DescriptorTable, MetricDescriptor, Timestamp};
use crate::{DEFAULT_TIMEOUT_SECS, METRIC_NAMESPACE};

// ----------------------------------------------------------------------------
// 9.1 Collector Trait
// ----------------------------------------------------------------------------

/// One exported domain as seen by the exposition layer.
#[async_trait]
pub trait DomainCollector: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool;

    /// Every family this domain can emit, health families included.
    fn describe(&self) -> &[MetricDescriptor];

    /// Drain the current snapshot and health into `sink`. On-demand domains
    /// may refresh first; a failed refresh still serves the previous snapshot.
    async fn collect(&self, sink: &mut dyn MetricSink);

    /// Begin scheduled refreshes.
    async fn start(&self);

    /// Cancel scheduled refreshes and wait for the task to exit.
    async fn stop(&self);

    /// Run one refresh now, regardless of mode.
    async fn refresh(&self) -> ExporterResult<Arc<Snapshot>>;

    fn snapshot(&self) -> Arc<Snapshot>;

    fn health(&self) -> HealthRecord;
}

// ----------------------------------------------------------------------------
// 9.2 Health Families
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct HealthDescriptors {
    scrape_duration: MetricDescriptor,
    success: MetricDescriptor,
    cache_age: MetricDescriptor,
    skipped: MetricDescriptor,
    truncated: MetricDescriptor,
    skipped_by_reason: MetricDescriptor,
}

impl HealthDescriptors {
    fn new(subsystem: &str, title: &str) -> Self {
        let gauge = |name: &str, help: String, labels: &[&'static str]| {
            MetricDescriptor::gauge(METRIC_NAMESPACE, subsystem, name, help, labels)
        };

        Self {
            scrape_duration: gauge(
                "scrape_duration_seconds",
                format!("Time it took for exporter to refresh {} metrics", title),
                &[],
            ),
            success: gauge("collector_success", format!("Whether {} collector succeeded", title), &[]),
            cache_age: gauge("cache_age_seconds", format!("Age of latest {} cache refresh", title), &[]),
            skipped: gauge(
                "entries_skipped",
                format!("Number of {} entries skipped during latest refresh", title),
                &[],
            ),
            truncated: gauge(
                "entries_truncated",
                format!("Whether {} collection hit a configured limit (1=yes, 0=no)", title),
                &[],
            ),
            skipped_by_reason: gauge(
                "entries_skipped_by_reason",
                format!("Number of {} entries skipped during latest refresh, by reason", title),
                &["reason"],
            ),
        }
    }

    fn all(&self) -> [MetricDescriptor; 6] {
        [
            self.scrape_duration.clone(),
            self.success.clone(),
            self.cache_age.clone(),
            self.skipped.clone(),
            self.truncated.clone(),
            self.skipped_by_reason.clone(),
        ]
    }
}

// ----------------------------------------------------------------------------
// 9.3 Domain Engine
// ----------------------------------------------------------------------------

struct EngineCore<P: Pipeline> {
    pipeline: P,
    cache: SnapshotCache,
    store: Arc<dyn SourceStore>,
    config: DomainConfig,
    policy: RefreshPolicy,
    descriptors: DescriptorTable,
    health: HealthDescriptors,
}

impl<P: Pipeline> EngineCore<P> {
    async fn produce(&self, phase: PhaseTracker) -> ExporterResult<Snapshot> {
        let ctx = ScrapeContext::new(self.pipeline.name(), self.store.clone(), &self.config, phase);
        let extraction = self.pipeline.extract(&ctx).await?;
        if !extraction.ledger.is_balanced() {
            warn!(
                target: "sonic::engine",
                domain = self.pipeline.name(),
                stages = ?extraction.ledger.unbalanced(),
                "Skip ledger does not balance"
            );
        }
        Ok(extraction.into_snapshot())
    }

    async fn refresh(&self, trigger: &'static str) -> ExporterResult<Arc<Snapshot>> {
        let result = self
            .cache
            .refresh(self.policy.timeout, |phase| self.produce(phase))
            .await;
        match &result {
            Ok(snapshot) => crate::log_refresh!(self.pipeline.name(), "committed", trigger, version = snapshot.version),
            Err(_) => crate::log_refresh!(self.pipeline.name(), "failed", trigger),
        }
        result
    }

    async fn refresh_if_stale(&self) {
        let outcome = self
            .cache
            .refresh_if_stale(self.policy.freshness, self.policy.timeout, |phase| self.produce(phase))
            .await;
        if let Ok(true) = outcome {
            crate::log_refresh!(self.pipeline.name(), "committed", trigger = "on_demand");
        }
    }
}

/// Lifecycle of the background refresh task. `Starting` holds the slot
/// while the start-up refresh runs so a concurrent `start` backs off.
#[derive(Debug, Default)]
enum TaskSlot {
    #[default]
    Idle,
    Starting,
    Running(RefreshTask),
}

/// A pipeline bound to its cache, store and schedule.
pub struct DomainEngine<P: Pipeline> {
    core: Arc<EngineCore<P>>,
    task: Mutex<TaskSlot>,
}

impl<P: Pipeline> std::fmt::Debug for DomainEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainEngine")
            .field("domain", &self.core.pipeline.name())
            .field("enabled", &self.core.config.enabled)
            .field("policy", &self.core.policy)
            .finish()
    }
}

impl<P: Pipeline> DomainEngine<P> {
    pub fn new(pipeline: P, store: Arc<dyn SourceStore>, config: DomainConfig) -> Self {
        let name = pipeline.name();
        let health = HealthDescriptors::new(name, pipeline.title());

        let mut descriptors = DescriptorTable::new();
        descriptors.extend(pipeline.descriptors().as_slice().iter().cloned());
        descriptors.extend(health.all());

        if !config.enabled {
            info!(target: "sonic::engine", domain = name, "{} collector is disabled", pipeline.title());
        }

        Self {
            core: Arc::new(EngineCore {
                policy: RefreshPolicy::from_config(&config),
                cache: SnapshotCache::new(name),
                pipeline,
                store,
                config,
                descriptors,
                health,
            }),
            task: Mutex::new(TaskSlot::Idle),
        }
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.core.policy
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.core.cache
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.task.lock(), TaskSlot::Running(task) if !task.is_finished())
    }

    fn emit_health(&self, sink: &mut dyn MetricSink, snapshot: &Snapshot, health: &HealthRecord, age: f64) {
        let h = &self.core.health;
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        sink.record(&h.scrape_duration, &h.scrape_duration.sample(health.duration_seconds, &[]));
        sink.record(&h.success, &h.success.sample(flag(health.success), &[]));
        sink.record(&h.cache_age, &h.cache_age.sample(age, &[]));
        sink.record(&h.skipped, &h.skipped.sample(snapshot.skipped as f64, &[]));
        sink.record(&h.truncated, &h.truncated.sample(flag(snapshot.truncated), &[]));
        for reason in SkipReason::ALL {
            let count = snapshot.skipped_for(reason) as f64;
            sink.record(&h.skipped_by_reason, &h.skipped_by_reason.sample(count, &[reason.as_str()]));
        }
    }
}

#[async_trait]
impl<P: Pipeline> DomainCollector for DomainEngine<P> {
    fn name(&self) -> &'static str {
        self.core.pipeline.name()
    }

    fn is_enabled(&self) -> bool {
        self.core.config.enabled
    }

    fn describe(&self) -> &[MetricDescriptor] {
        self.core.descriptors.as_slice()
    }

    async fn collect(&self, sink: &mut dyn MetricSink) {
        if !self.is_enabled() {
            return;
        }
        if self.core.policy.refreshes_on_read() {
            self.core.refresh_if_stale().await;
        }

        let view = self.core.cache.view();
        let now = Timestamp::now();

        for descriptor in self.describe() {
            sink.describe(descriptor);
        }
        for record in &view.snapshot.records {
            match self.core.descriptors.get(&record.name) {
                Some(descriptor) => sink.record(descriptor, record),
                None => debug!(target: "sonic::engine", domain = self.name(), metric = %record.name, "Record without descriptor"),
            }
        }
        for record in self.core.pipeline.collect_extras(&view.snapshot, now) {
            if let Some(descriptor) = self.core.descriptors.get(&record.name) {
                sink.record(descriptor, &record);
            }
        }
        self.emit_health(sink, &view.snapshot, &view.health, view.age_seconds(now));
    }

    async fn start(&self) {
        if !self.is_enabled() || !self.core.policy.is_background() {
            return;
        }
        {
            let mut slot = self.task.lock();
            if !matches!(*slot, TaskSlot::Idle) {
                return;
            }
            *slot = TaskSlot::Starting;
        }

        // Serve real data from the first scrape; failures are already
        // recorded in the health record.
        let _ = self.core.refresh("startup").await;

        let core = self.core.clone();
        let task = RefreshTask::spawn(self.name(), self.core.policy.period, move || {
            let core = core.clone();
            async move {
                let _ = core.refresh("interval").await;
            }
        });

        let orphan = {
            let mut slot = self.task.lock();
            if matches!(*slot, TaskSlot::Starting) {
                *slot = TaskSlot::Running(task);
                None
            } else {
                Some(task)
            }
        };
        // stop() ran during the start-up refresh, or a later start() owns the slot
        if let Some(task) = orphan {
            debug!(target: "sonic::engine", domain = self.name(), "Start superseded, cancelling refresh task");
            task.stop().await;
        }
    }

    async fn stop(&self) {
        let slot = std::mem::take(&mut *self.task.lock());
        if let TaskSlot::Running(task) = slot {
            task.stop().await;
        }
    }

    async fn refresh(&self) -> ExporterResult<Arc<Snapshot>> {
        self.core.refresh("manual").await
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.core.cache.read()
    }

    fn health(&self) -> HealthRecord {
        self.core.cache.health()
    }
}

// ----------------------------------------------------------------------------
// 9.4 Collector Registry
// ----------------------------------------------------------------------------

/// Open the configured source: fixture dumps when a directory is given,
/// otherwise the live redis endpoint.
pub fn open_store(config: &StoreConfig) -> ExporterResult<Arc<dyn SourceStore>> {
    match &config.fixtures {
        Some(dir) => {
            let store = MemoryStore::from_fixture_dir(dir)?;
            info!(target: "sonic::store", path = %dir.display(), "Serving from fixture dumps");
            Ok(Arc::new(store))
        }
        None => {
            let store = RedisStore::from_address(&config.address)?;
            info!(target: "sonic::store", endpoint = %store.endpoint(), "Using redis store");
            Ok(Arc::new(store))
        }
    }
}

/// Log whether the source answers before collectors start. Never fatal:
/// domains serve empty snapshots until the store comes up.
pub async fn probe_store(store: &dyn SourceStore) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    match store.server_info(deadline).await {
        Ok(info) => match info.get("redis_version") {
            Some(version) => {
                info!(target: "sonic::store", endpoint = %store.endpoint(), version = %version, "Source store reachable")
            }
            None => debug!(target: "sonic::store", endpoint = %store.endpoint(), "Source store reachable"),
        },
        Err(e) => {
            warn!(target: "sonic::store", endpoint = %store.endpoint(), error = %e, "Source store not reachable yet")
        }
    }
}

/// All domain collectors, in exposition order.
pub struct CollectorRegistry {
    collectors: Vec<Arc<dyn DomainCollector>>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.collectors.iter().map(|c| c.name())).finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self { collectors: Vec::new() }
    }

    /// The five domains, in order: vlan, lag, fdb, lldp, docker.
    pub fn from_config(config: &ExporterConfig, store: Arc<dyn SourceStore>) -> Self {
        let mut registry = Self::new();
        registry.register(DomainEngine::new(VlanPipeline::new(), store.clone(), config.vlan.clone()));
        registry.register(DomainEngine::new(LagPipeline::new(), store.clone(), config.lag.clone()));
        registry.register(DomainEngine::new(
            FdbPipeline::new(config.fdb.max_ports, config.fdb.max_vlans),
            store.clone(),
            config.fdb.domain.clone(),
        ));
        registry.register(DomainEngine::new(
            LldpPipeline::new(config.lldp.include_mgmt),
            store.clone(),
            config.lldp.domain.clone(),
        ));
        registry.register(DomainEngine::new(
            DockerPipeline::new(config.docker.source_stale_threshold),
            store,
            config.docker.domain.clone(),
        ));
        registry
    }

    pub fn register<C: DomainCollector + 'static>(&mut self, collector: C) {
        self.collectors.push(Arc::new(collector));
    }

    pub fn collectors(&self) -> &[Arc<dyn DomainCollector>] {
        &self.collectors
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DomainCollector>> {
        self.collectors.iter().find(|c| c.name() == name)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<dyn DomainCollector>> + '_ {
        self.collectors.iter().filter(|c| c.is_enabled())
    }

    /// Start every enabled domain. Start-up refreshes run concurrently.
    pub async fn start_all(&self) {
        futures::future::join_all(self.enabled().map(|c| c.start())).await;
        info!(
            target: "sonic::engine",
            domains = ?self.enabled().map(|c| c.name()).collect::<Vec<_>>(),
            "Collectors started"
        );
    }

    pub async fn stop_all(&self) {
        futures::future::join_all(self.collectors.iter().map(|c| c.stop())).await;
        info!(target: "sonic::engine", "Collectors stopped");
    }

    /// One refresh per enabled domain, concurrently.
    pub async fn refresh_all(&self) -> Vec<(&'static str, ExporterResult<Arc<Snapshot>>)> {
        let enabled: Vec<_> = self.enabled().collect();
        let results = futures::future::join_all(enabled.iter().map(|c| c.refresh())).await;
        enabled.iter().map(|c| c.name()).zip(results).collect()
    }

    pub async fn collect_all(&self, sink: &mut dyn MetricSink) {
        for collector in self.enabled() {
            collector.collect(sink).await;
        }
    }

    /// Text exposition of every enabled domain.
    pub async fn render(&self) -> ExporterResult<String> {
        let mut sink = FamilySink::new();
        self.collect_all(&mut sink).await;
        render_text(&sink.finish())
    }

    pub fn health(&self) -> Vec<(&'static str, HealthRecord)> {
        self.enabled().map(|c| (c.name(), c.health())).collect()
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefreshMode;
    use crate::exposition::VecSink;
    use crate::store::Database;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn vlan_store() -> Arc<MemoryStore> {
        Arc::new(
            MemoryStore::new()
                .with_hash(Database::ConfigDb, "VLAN|Vlan1000", [("vlanid", "1000")])
                .with_hash(Database::ConfigDb, "VLAN_MEMBER|Vlan1000|Ethernet0", [("tagging_mode", "untagged")]),
        )
    }

    #[tokio::test]
    async fn test_collect_before_first_refresh_reports_failure_state() {
        let engine = DomainEngine::new(VlanPipeline::new(), vlan_store(), DomainConfig::default());
        let mut sink = VecSink::new();
        engine.collect(&mut sink).await;

        assert_eq!(sink.value("sonic_vlan_collector_success", &[]), Some(0.0));
        assert_eq!(sink.value("sonic_vlan_cache_age_seconds", &[]), Some(0.0));
        assert_eq!(sink.find("sonic_vlan_info").count(), 0);
        assert!(sink.is_described("sonic_vlan_info"));
    }

    #[tokio::test]
    async fn test_start_refreshes_then_serves_snapshot() {
        let engine = DomainEngine::new(VlanPipeline::new(), vlan_store(), DomainConfig::default());
        engine.start().await;
        assert!(engine.is_running());

        let mut sink = VecSink::new();
        engine.collect(&mut sink).await;
        assert_eq!(sink.value("sonic_vlan_collector_success", &[]), Some(1.0));
        assert_eq!(sink.value("sonic_vlan_members", &[("vlan", "Vlan1000")]), Some(1.0));
        assert_eq!(
            sink.value("sonic_vlan_entries_skipped_by_reason", &[("reason", "over_child_cap")]),
            Some(0.0)
        );
        assert_eq!(sink.find("sonic_vlan_entries_skipped_by_reason").count(), SkipReason::ALL.len());

        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_starts_share_one_task() {
        let store = vlan_store();
        store.set_latency(Some(Duration::from_millis(5)));
        let engine = DomainEngine::new(VlanPipeline::new(), store.clone(), DomainConfig::default());

        futures::join!(engine.start(), engine.start());
        assert!(engine.is_running());
        assert_eq!(engine.health().attempts, 1);

        engine.stop().await;
        assert!(!engine.is_running());
        let calls = store.call_count();

        tokio::time::advance(Duration::from_secs(95)).await;
        tokio::task::yield_now().await;
        assert_eq!(engine.health().attempts, 1);
        assert_eq!(store.call_count(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_startup_cancels_the_task() {
        let store = vlan_store();
        store.set_latency(Some(Duration::from_millis(5)));
        let engine = DomainEngine::new(VlanPipeline::new(), store.clone(), DomainConfig::default());

        futures::join!(engine.start(), async {
            tokio::task::yield_now().await;
            engine.stop().await;
        });
        assert!(!engine.is_running());

        tokio::time::advance(Duration::from_secs(95)).await;
        tokio::task::yield_now().await;
        assert_eq!(engine.health().attempts, 1);
    }

    #[tokio::test]
    async fn test_on_demand_refreshes_on_collect() {
        let store = vlan_store();
        let config = DomainConfig::default()
            .with_mode(RefreshMode::OnDemand)
            .with_freshness(Duration::from_secs(60));
        let engine = DomainEngine::new(VlanPipeline::new(), store.clone(), config);

        engine.start().await;
        assert!(!engine.is_running());
        assert_eq!(store.call_count(), 0);

        let mut sink = VecSink::new();
        engine.collect(&mut sink).await;
        assert_eq!(sink.value("sonic_vlan_members", &[("vlan", "Vlan1000")]), Some(1.0));
        let calls = store.call_count();

        // still fresh: no second refresh
        engine.collect(&mut VecSink::new()).await;
        assert_eq!(store.call_count(), calls);
        assert_eq!(engine.health().attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let store = vlan_store();
        let engine = DomainEngine::new(VlanPipeline::new(), store.clone(), DomainConfig::default());
        engine.refresh().await.unwrap();

        store.set_unavailable(true);
        assert!(engine.refresh().await.is_err());

        let mut sink = VecSink::new();
        engine.collect(&mut sink).await;
        assert_eq!(sink.value("sonic_vlan_collector_success", &[]), Some(0.0));
        assert_eq!(sink.value("sonic_vlan_members", &[("vlan", "Vlan1000")]), Some(1.0));
        assert_eq!(engine.health().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_disabled_domain_emits_nothing() {
        let engine = DomainEngine::new(
            VlanPipeline::new(),
            vlan_store(),
            DomainConfig::default().with_enabled(false),
        );
        engine.start().await;
        assert!(!engine.is_running());

        let mut sink = VecSink::new();
        engine.collect(&mut sink).await;
        assert!(sink.records.is_empty());
    }

    #[tokio::test]
    async fn test_registry_order_and_enabled_set() {
        let registry = CollectorRegistry::from_config(&ExporterConfig::default(), vlan_store());
        let names: Vec<&str> = registry.collectors().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["vlan", "lag", "fdb", "lldp", "docker"]);

        let enabled: Vec<&str> = registry.enabled().map(|c| c.name()).collect();
        assert_eq!(enabled, vec!["vlan", "lag", "lldp"]);
    }

    #[tokio::test]
    async fn test_registry_render() {
        let registry = CollectorRegistry::from_config(&ExporterConfig::default(), vlan_store());
        let results = registry.refresh_all().await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let text = registry.render().await.unwrap();
        assert!(text.contains("sonic_vlan_info{vlan=\"Vlan1000\",vlan_id=\"1000\"} 1"));
        assert!(text.contains("sonic_lag_collector_success 1"));
        assert!(text.contains("sonic_lldp_neighbors 0"));
        assert!(!text.contains("sonic_fdb_"));
    }
}
