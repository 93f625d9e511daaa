//! Forwarding database domain: learned and static MAC entries aggregated by
//! VLAN, port and entry type.
//!
//! Entries reference VLANs and ports only through ASIC object ids, so every
//! cycle first builds the [`JoinMaps`] and then resolves entries against
//! them. Raw entry processing is bounded by `max_entities`; the number of
//! distinct VLAN and port series is bounded separately.

mod resolver;

pub use resolver::{
    normalize_fdb_type, parse_fdb_key, FdbEntryKey, JoinMaps, VlanResolution, BRIDGE_PORT_PREFIX, FDB_ENTRY_PREFIX,
    LAG_NAME_MAP, PORT_NAME_MAP, VLAN_OBJECT_PREFIX,
};

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::accounting::SkipLedger;
use crate::cache::CyclePhase;
use crate::error::{ExporterResult, SkipReason};
use crate::fields::field;
use crate::pipeline::{Extraction, Pipeline, ScrapeContext};
use crate::store::Database;
use crate::types::{DescriptorTable, MetricDescriptor, MetricRecord};
use crate::METRIC_NAMESPACE;

const SUBSYSTEM: &str = "fdb";

const TYPE_FIELD: &str = "SAI_FDB_ENTRY_ATTR_TYPE";
const BRIDGE_PORT_FIELD: &str = "SAI_FDB_ENTRY_ATTR_BRIDGE_PORT_ID";

/// Ledger stages for the per-series bounds.
pub const VLAN_SERIES_STAGE: &str = "series:vlan";
pub const PORT_SERIES_STAGE: &str = "series:port";

/// Per-cycle aggregation of resolved entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdbTotals {
    pub entries: u64,
    pub unknown_vlan: u64,
    pub by_vlan: BTreeMap<String, u64>,
    pub by_port: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
}

impl FdbTotals {
    pub fn add(&mut self, vlan: &VlanResolution, port: &str, entry_type: &str) {
        self.entries += 1;
        if vlan.is_unknown() {
            self.unknown_vlan += 1;
        }
        *self.by_vlan.entry(vlan.label().to_string()).or_insert(0) += 1;
        *self.by_port.entry(port.to_string()).or_insert(0) += 1;
        *self.by_type.entry(entry_type.to_string()).or_insert(0) += 1;
    }
}

/// Keep the first `cap` series in label order and book the rest.
fn bound_series<'a>(
    series: &'a BTreeMap<String, u64>,
    cap: usize,
    stage: &'static str,
    ledger: &mut SkipLedger,
) -> impl Iterator<Item = (&'a String, &'a u64)> {
    let kept = series.len().min(cap);
    ledger.seen(stage, series.len());
    ledger.accept_n(stage, kept);
    ledger.skip_n(stage, SkipReason::OverSeriesCap, series.len() - kept);
    series.iter().take(kept)
}

#[derive(Debug)]
pub struct FdbPipeline {
    max_ports: usize,
    max_vlans: usize,
    table: DescriptorTable,
    entries: MetricDescriptor,
    by_port: MetricDescriptor,
    by_vlan: MetricDescriptor,
    by_type: MetricDescriptor,
    unknown_vlan: MetricDescriptor,
}

impl FdbPipeline {
    pub fn new(max_ports: usize, max_vlans: usize) -> Self {
        let gauge = |name: &str, help: &str, labels: &[&'static str]| {
            MetricDescriptor::gauge(METRIC_NAMESPACE, SUBSYSTEM, name, help, labels)
        };

        let entries = gauge("entries", "Number of FDB entries", &[]);
        let by_port = gauge("entries_by_port", "Number of FDB entries by port", &["port"]);
        let by_vlan = gauge("entries_by_vlan", "Number of FDB entries by VLAN", &["vlan"]);
        let by_type = gauge("entries_by_type", "Number of FDB entries by entry type", &["entry_type"]);
        let unknown_vlan = gauge(
            "entries_unknown_vlan",
            "Number of FDB entries with unknown VLAN mapping",
            &[],
        );

        let mut table = DescriptorTable::new();
        table.extend([
            entries.clone(),
            by_port.clone(),
            by_vlan.clone(),
            by_type.clone(),
            unknown_vlan.clone(),
        ]);

        Self {
            max_ports,
            max_vlans,
            table,
            entries,
            by_port,
            by_vlan,
            by_type,
            unknown_vlan,
        }
    }

    fn emit(&self, totals: &FdbTotals, ledger: &mut SkipLedger) -> Vec<MetricRecord> {
        let mut records = Vec::with_capacity(2 + totals.by_vlan.len() + totals.by_port.len() + totals.by_type.len());
        records.push(self.entries.sample(totals.entries as f64, &[]));
        records.push(self.unknown_vlan.sample(totals.unknown_vlan as f64, &[]));

        for (vlan, count) in bound_series(&totals.by_vlan, self.max_vlans, VLAN_SERIES_STAGE, ledger) {
            records.push(self.by_vlan.sample(*count as f64, &[vlan]));
        }
        for (port, count) in bound_series(&totals.by_port, self.max_ports, PORT_SERIES_STAGE, ledger) {
            records.push(self.by_port.sample(*count as f64, &[port]));
        }
        for (entry_type, count) in &totals.by_type {
            records.push(self.by_type.sample(*count as f64, &[entry_type]));
        }
        records
    }
}

#[async_trait]
impl Pipeline for FdbPipeline {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn title(&self) -> &'static str {
        "FDB"
    }

    fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    async fn extract(&self, ctx: &ScrapeContext) -> ExporterResult<Extraction> {
        let mut ledger = SkipLedger::new();

        ctx.enter(CyclePhase::Scanning);
        let maps = JoinMaps::build(ctx, &mut ledger).await?;
        let keys = ctx.scan(Database::AsicDb, FDB_ENTRY_PREFIX).await?;
        ledger.seen(FDB_ENTRY_PREFIX, keys.len());

        ctx.enter(CyclePhase::Joining);
        let ceiling = ctx.limits.max_entities;
        let truncated = keys.len() > ceiling;
        if truncated {
            ledger.skip_n(FDB_ENTRY_PREFIX, SkipReason::OverEntryCap, keys.len() - ceiling);
        }

        let mut totals = FdbTotals::default();
        for key in keys.iter().take(ceiling) {
            let Some(entry) = parse_fdb_key(key) else {
                ledger.skip(FDB_ENTRY_PREFIX, SkipReason::MalformedKey);
                continue;
            };
            let fields = ctx.hget_all(Database::AsicDb, key).await?;
            if fields.is_empty() {
                ledger.skip(FDB_ENTRY_PREFIX, SkipReason::MissingRequiredField);
                continue;
            }

            let vlan = maps.resolve_vlan(&entry);
            let port = maps.resolve_port(field(&fields, BRIDGE_PORT_FIELD));
            let entry_type = normalize_fdb_type(field(&fields, TYPE_FIELD));
            totals.add(&vlan, port, &entry_type);
            ledger.accept(FDB_ENTRY_PREFIX);
        }

        ctx.enter(CyclePhase::Bounding);
        if truncated {
            debug!(
                target: "sonic::fdb",
                ceiling,
                discovered = keys.len(),
                "FDB entry ceiling reached"
            );
        }

        ctx.enter(CyclePhase::Emitting);
        let records = self.emit(&totals, &mut ledger);

        Ok(Extraction {
            records,
            ledger,
            truncated,
            source_updated_at: None,
        })
    }
}
