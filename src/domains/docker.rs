//! Container domain: per-container resource usage published by the switch's
//! own stats daemon, plus the freshness of that publication.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::debug;

use crate::accounting::SkipLedger;
use crate::cache::{CyclePhase, Snapshot};
use crate::error::{ExporterResult, SkipReason};
use crate::fields::field;
use crate::pipeline::{Extraction, Pipeline, ScrapeContext};
use crate::store::{Database, FieldMap};
use crate::types::{DescriptorTable, MetricDescriptor, MetricRecord, Timestamp};
use crate::METRIC_NAMESPACE;

const SUBSYSTEM: &str = "docker";
const STATS_PREFIX: &str = "DOCKER_STATS|";
const LAST_UPDATE_KEY: &str = "DOCKER_STATS|LastUpdateTime";

/// Ledger stage for per-container numeric fields.
pub const FIELD_STAGE: &str = "container_fields";

const LAST_UPDATE_FIELDS: [&str; 4] = ["lastupdate", "last_update", "LastUpdate", "LastUpdateTime"];

// Offset-less layouts are read as UTC.
const NAIVE_LAYOUTS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
const ZONED_LAYOUTS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"];

/// Value of the last-update hash, trying the known field spellings first
/// and then any key that normalises to one of them.
pub fn resolve_last_update(fields: &FieldMap) -> Option<&str> {
    for name in LAST_UPDATE_FIELDS {
        let value = field(fields, name).trim();
        if !value.is_empty() {
            return Some(value);
        }
    }

    fields.iter().find_map(|(key, value)| {
        let normalized = key.trim().replace('_', "").to_lowercase();
        let value = value.trim();
        let matches = normalized == "lastupdate" || normalized == "lastupdatetime";
        (matches && !value.is_empty()).then_some(value)
    })
}

pub fn parse_source_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(Timestamp::from_datetime(dt.with_timezone(&Utc)));
    }
    for layout in ZONED_LAYOUTS {
        if let Ok(dt) = DateTime::parse_from_str(raw, layout) {
            return Some(Timestamp::from_datetime(dt.with_timezone(&Utc)));
        }
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(Timestamp::from_datetime(Utc.from_utc_datetime(&naive)));
        }
    }
    None
}

fn parse_stat(fields: &FieldMap, name: &str) -> Option<f64> {
    let raw = field(fields, name).trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok()
}

/// Source field backing one per-container series.
#[derive(Debug)]
struct StatSeries {
    field: &'static str,
    descriptor: MetricDescriptor,
}

#[derive(Debug)]
pub struct DockerPipeline {
    stale_threshold: Duration,
    table: DescriptorTable,
    container_info: MetricDescriptor,
    stats: Vec<StatSeries>,
    containers: MetricDescriptor,
    source_last_update: MetricDescriptor,
    source_age: MetricDescriptor,
    source_stale: MetricDescriptor,
}

impl DockerPipeline {
    pub fn new(stale_threshold: Duration) -> Self {
        let gauge = |name: &str, help: &str, labels: &[&'static str]| {
            MetricDescriptor::gauge(METRIC_NAMESPACE, SUBSYSTEM, name, help, labels)
        };
        let counter = |name: &str, help: &str| {
            MetricDescriptor::counter(METRIC_NAMESPACE, SUBSYSTEM, name, help, &["container"])
        };

        let container_info = gauge(
            "container_info",
            "Container metadata from SONiC DOCKER_STATS, value is always 1",
            &["container"],
        );

        let stat = |field, descriptor| StatSeries { field, descriptor };
        let stats = vec![
            stat("CPU%", gauge("container_cpu_percent", "Container CPU usage percent", &["container"])),
            stat("MEM_BYTES", gauge("container_memory_usage_bytes", "Container memory usage bytes", &["container"])),
            stat("MEM_LIMIT_BYTES", gauge("container_memory_limit_bytes", "Container memory limit bytes", &["container"])),
            stat("MEM%", gauge("container_memory_percent", "Container memory usage percent", &["container"])),
            stat("NET_IN_BYTES", counter("container_network_receive_bytes_total", "Container network receive bytes")),
            stat("NET_OUT_BYTES", counter("container_network_transmit_bytes_total", "Container network transmit bytes")),
            stat("BLOCK_IN_BYTES", counter("container_block_read_bytes_total", "Container block read bytes")),
            stat("BLOCK_OUT_BYTES", counter("container_block_write_bytes_total", "Container block write bytes")),
            stat("PIDS", gauge("container_pids", "Container process count", &["container"])),
        ];

        let containers = gauge("containers", "Number of containers with DOCKER_STATS entries", &[]);
        let source_last_update = gauge(
            "source_last_update_timestamp_seconds",
            "Unix timestamp of DOCKER_STATS|LastUpdateTime source update",
            &[],
        );
        let source_age = gauge("source_age_seconds", "Age in seconds of DOCKER_STATS source update", &[]);
        let source_stale = gauge(
            "source_stale",
            "Whether DOCKER_STATS source data is stale (1=yes, 0=no)",
            &[],
        );

        let mut table = DescriptorTable::new();
        table.push(container_info.clone());
        table.extend(stats.iter().map(|s| s.descriptor.clone()));
        table.extend([
            containers.clone(),
            source_last_update.clone(),
            source_age.clone(),
            source_stale.clone(),
        ]);

        Self {
            stale_threshold,
            table,
            container_info,
            stats,
            containers,
            source_last_update,
            source_age,
            source_stale,
        }
    }

    /// Missing or unparsable source time counts as stale.
    pub fn is_source_stale(&self, updated_at: Option<Timestamp>, now: Timestamp) -> bool {
        match updated_at {
            Some(ts) => now.duration_since(ts) > self.stale_threshold,
            None => true,
        }
    }
}

#[async_trait]
impl Pipeline for DockerPipeline {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn title(&self) -> &'static str {
        "docker"
    }

    fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    async fn extract(&self, ctx: &ScrapeContext) -> ExporterResult<Extraction> {
        let mut ledger = SkipLedger::new();

        ctx.enter(CyclePhase::Scanning);
        let last_update = ctx.hget_all(Database::StateDb, LAST_UPDATE_KEY).await?;
        let source_updated_at = match resolve_last_update(&last_update) {
            Some(raw) => {
                let parsed = parse_source_timestamp(raw);
                if parsed.is_none() {
                    debug!(target: "sonic::docker", value = raw, "Unparsable DOCKER_STATS update time");
                }
                parsed
            }
            None => {
                debug!(target: "sonic::docker", "DOCKER_STATS update time missing");
                None
            }
        };

        let keys: Vec<String> = ctx
            .scan(Database::StateDb, STATS_PREFIX)
            .await?
            .into_iter()
            .filter(|k| k != LAST_UPDATE_KEY)
            .collect();
        ledger.seen(STATS_PREFIX, keys.len());

        ctx.enter(CyclePhase::Bounding);
        let max_containers = ctx.limits.max_entities;
        let mut records = Vec::with_capacity(keys.len() * (self.stats.len() + 1) + 3);
        let mut containers = 0usize;

        for key in &keys {
            if containers >= max_containers {
                ledger.skip(STATS_PREFIX, SkipReason::OverParentCap);
                continue;
            }

            let fields = ctx.hget_all(Database::StateDb, key).await?;
            let name = field(&fields, "NAME").trim();
            if name.is_empty() {
                debug!(target: "sonic::docker", key = %key, "Container entry without NAME");
                ledger.skip(STATS_PREFIX, SkipReason::MissingRequiredField);
                continue;
            }
            ledger.accept(STATS_PREFIX);

            records.push(self.container_info.sample(1.0, &[name]));
            ledger.seen(FIELD_STAGE, self.stats.len());
            for series in &self.stats {
                match parse_stat(&fields, series.field) {
                    Some(value) => {
                        records.push(series.descriptor.sample(value, &[name]));
                        ledger.accept(FIELD_STAGE);
                    }
                    None => ledger.skip(FIELD_STAGE, SkipReason::MissingRequiredField),
                }
            }
            containers += 1;
        }

        ctx.enter(CyclePhase::Emitting);
        let stale = self.is_source_stale(source_updated_at, Timestamp::now());
        records.push(self.containers.sample(containers as f64, &[]));
        records.push(self.source_last_update.sample(
            source_updated_at.map(|ts| ts.as_secs() as f64).unwrap_or(0.0),
            &[],
        ));
        records.push(self.source_stale.sample(if stale { 1.0 } else { 0.0 }, &[]));

        let truncated = ledger.hit_capacity();
        Ok(Extraction {
            records,
            ledger,
            truncated,
            source_updated_at,
        })
    }

    fn collect_extras(&self, snapshot: &Snapshot, now: Timestamp) -> Vec<MetricRecord> {
        let age = snapshot
            .source_updated_at
            .map(|ts| now.duration_since(ts).as_secs_f64())
            .unwrap_or(0.0);
        vec![self.source_age.sample(age, &[])]
    }
}
