//! LLDP domain: one info record per discovered neighbour.

use async_trait::async_trait;

use crate::accounting::SkipLedger;
use crate::cache::CyclePhase;
use crate::error::{ExporterResult, SkipReason};
use crate::fields::{field, strip_identifier};
use crate::pipeline::{Extraction, Pipeline, ScrapeContext};
use crate::store::Database;
use crate::types::{DescriptorTable, MetricDescriptor};
use crate::METRIC_NAMESPACE;

const SUBSYSTEM: &str = "lldp";
const ENTRY_PREFIX: &str = "LLDP_ENTRY_TABLE:";
const MGMT_INTERFACE: &str = "eth0";

const NEIGHBOR_LABELS: &[&str] = &[
    "local_interface",
    "local_role",
    "remote_system_name",
    "remote_port_id",
    "remote_port_desc",
    "remote_port_id_subtype",
    "remote_port_display",
    "remote_chassis_id",
    "remote_mgmt_ip",
];

/// Role of the local interface a neighbour was seen on.
pub fn local_role(interface: &str) -> &'static str {
    if interface == MGMT_INTERFACE {
        "management"
    } else if interface.starts_with("Ethernet") {
        "frontpanel"
    } else {
        "other"
    }
}

/// Port label shown for a neighbour. Subtypes that carry a locally
/// assigned or MAC identifier prefer the human readable description.
pub fn remote_port_display<'a>(port_id: &'a str, port_desc: &'a str, subtype: &str) -> &'a str {
    let subtype = subtype.trim().to_lowercase();
    let prefers_desc = matches!(subtype.as_str(), "7" | "local" | "3" | "mac");

    if !port_desc.is_empty() && prefers_desc {
        port_desc
    } else if !port_id.is_empty() {
        port_id
    } else {
        port_desc
    }
}

#[derive(Debug)]
pub struct LldpPipeline {
    include_mgmt: bool,
    table: DescriptorTable,
    neighbor_info: MetricDescriptor,
    neighbors: MetricDescriptor,
}

impl LldpPipeline {
    pub fn new(include_mgmt: bool) -> Self {
        let neighbor_info = MetricDescriptor::gauge(
            METRIC_NAMESPACE,
            SUBSYSTEM,
            "neighbor_info",
            "Non-numeric data about LLDP neighbor, value is always 1",
            NEIGHBOR_LABELS,
        );
        let neighbors = MetricDescriptor::gauge(
            METRIC_NAMESPACE,
            SUBSYSTEM,
            "neighbors",
            "Number of LLDP neighbors exported",
            &[],
        );

        let mut table = DescriptorTable::new();
        table.extend([neighbor_info.clone(), neighbors.clone()]);

        Self {
            include_mgmt,
            table,
            neighbor_info,
            neighbors,
        }
    }
}

#[async_trait]
impl Pipeline for LldpPipeline {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn title(&self) -> &'static str {
        "LLDP"
    }

    fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    async fn extract(&self, ctx: &ScrapeContext) -> ExporterResult<Extraction> {
        let mut ledger = SkipLedger::new();

        ctx.enter(CyclePhase::Scanning);
        let keys = ctx.scan(Database::ApplDb, ENTRY_PREFIX).await?;
        ledger.seen(ENTRY_PREFIX, keys.len());

        ctx.enter(CyclePhase::Bounding);
        let max_neighbors = ctx.limits.max_entities;
        let mut records = Vec::new();
        let mut emitted = 0usize;

        for key in &keys {
            if emitted >= max_neighbors {
                ledger.skip(ENTRY_PREFIX, SkipReason::OverParentCap);
                continue;
            }
            let Some(interface) = strip_identifier(key, ENTRY_PREFIX) else {
                ledger.skip(ENTRY_PREFIX, SkipReason::MalformedKey);
                continue;
            };
            if !self.include_mgmt && interface == MGMT_INTERFACE {
                ledger.skip(ENTRY_PREFIX, SkipReason::Filtered);
                continue;
            }

            let fields = ctx.hget_all(Database::ApplDb, key).await?;
            let system_name = field(&fields, "lldp_rem_sys_name");
            let port_id = field(&fields, "lldp_rem_port_id");
            let port_desc = field(&fields, "lldp_rem_port_desc");
            let subtype = field(&fields, "lldp_rem_port_id_subtype");
            let chassis_id = field(&fields, "lldp_rem_chassis_id");
            let mgmt_ip = field(&fields, "lldp_rem_man_addr");

            if [system_name, port_id, port_desc, chassis_id, mgmt_ip].iter().all(|v| v.is_empty()) {
                ledger.skip(ENTRY_PREFIX, SkipReason::MissingRequiredField);
                continue;
            }

            records.push(self.neighbor_info.sample(
                1.0,
                &[
                    interface,
                    local_role(interface),
                    system_name,
                    port_id,
                    port_desc,
                    subtype,
                    remote_port_display(port_id, port_desc, subtype),
                    chassis_id,
                    mgmt_ip,
                ],
            ));
            ledger.accept(ENTRY_PREFIX);
            emitted += 1;
        }

        ctx.enter(CyclePhase::Emitting);
        records.push(self.neighbors.sample(emitted as f64, &[]));

        let truncated = ledger.hit_capacity();
        Ok(Extraction {
            records,
            ledger,
            truncated,
            source_updated_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PhaseTracker;
    use crate::config::DomainConfig;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::sync::Arc;

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_hash(
                Database::ApplDb,
                "LLDP_ENTRY_TABLE:Ethernet88",
                [
                    ("lldp_rem_sys_name", "net-tor-lab001.lau1"),
                    ("lldp_rem_port_id", "hundredGigE1/23"),
                    ("lldp_rem_port_desc", "Ethernet88"),
                    ("lldp_rem_port_id_subtype", "7"),
                    ("lldp_rem_chassis_id", "74:86:e2:6d:df:a5"),
                    ("lldp_rem_man_addr", "192.168.240.123"),
                ],
            )
            .with_hash(
                Database::ApplDb,
                "LLDP_ENTRY_TABLE:eth0",
                [
                    ("lldp_rem_sys_name", "oob-switch01"),
                    ("lldp_rem_port_id", "535"),
                    ("lldp_rem_port_desc", "ge-0/0/15.0"),
                    ("lldp_rem_port_id_subtype", "7"),
                    ("lldp_rem_chassis_id", "00:11:22:33:44:55"),
                    ("lldp_rem_man_addr", "192.168.240.1"),
                ],
            )
            .with_hash(Database::ApplDb, "LLDP_ENTRY_TABLE:Ethernet4", [("lldp_rem_port_id_subtype", "5")])
    }

    async fn run(include_mgmt: bool, config: DomainConfig) -> Extraction {
        let ctx = ScrapeContext::new("lldp", Arc::new(store()), &config, PhaseTracker::detached("lldp"));
        LldpPipeline::new(include_mgmt).extract(&ctx).await.unwrap()
    }

    #[rstest]
    #[case("Ethernet0", "frontpanel")]
    #[case("eth0", "management")]
    #[case("PortChannel1", "other")]
    fn test_local_role(#[case] interface: &str, #[case] expected: &str) {
        assert_eq!(local_role(interface), expected);
    }

    #[rstest]
    #[case("hundredGigE1/23", "Ethernet88", "7", "Ethernet88")]
    #[case("aa:bb", "uplink", " MAC ", "uplink")]
    #[case("Ethernet1", "uplink", "5", "Ethernet1")]
    #[case("", "uplink", "5", "uplink")]
    #[case("535", "", "local", "535")]
    fn test_remote_port_display(
        #[case] port_id: &str,
        #[case] port_desc: &str,
        #[case] subtype: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(remote_port_display(port_id, port_desc, subtype), expected);
    }

    #[tokio::test]
    async fn test_neighbors() {
        let out = run(true, DomainConfig::default()).await;
        assert!(out.ledger.is_balanced());
        let snap = out.into_snapshot();

        assert_eq!(snap.value("sonic_lldp_neighbors", &[]), Some(2.0));
        assert_eq!(
            snap.value(
                "sonic_lldp_neighbor_info",
                &[
                    ("local_interface", "Ethernet88"),
                    ("local_role", "frontpanel"),
                    ("remote_port_display", "Ethernet88"),
                    ("remote_chassis_id", "74:86:e2:6d:df:a5"),
                ]
            ),
            Some(1.0)
        );
        assert_eq!(
            snap.value(
                "sonic_lldp_neighbor_info",
                &[("local_interface", "eth0"), ("local_role", "management"), ("remote_port_display", "ge-0/0/15.0")]
            ),
            Some(1.0)
        );
        // every remote field empty
        assert_eq!(snap.skipped_for(SkipReason::MissingRequiredField), 1);
        assert!(!snap.truncated);
    }

    #[tokio::test]
    async fn test_management_interface_filtered() {
        let snap = run(false, DomainConfig::default()).await.into_snapshot();
        assert_eq!(snap.value("sonic_lldp_neighbors", &[]), Some(1.0));
        assert_eq!(snap.skipped_for(SkipReason::Filtered), 1);
        assert!(snap
            .find("sonic_lldp_neighbor_info")
            .all(|r| r.label("local_interface") != Some("eth0")));
    }

    #[tokio::test]
    async fn test_neighbor_cap() {
        let out = run(true, DomainConfig::default().with_caps(1, 1)).await;
        assert!(out.ledger.is_balanced());
        let snap = out.into_snapshot();
        assert_eq!(snap.value("sonic_lldp_neighbors", &[]), Some(1.0));
        // Ethernet4 and Ethernet88 sort first; Ethernet4 has no remote data
        assert_eq!(
            snap.value("sonic_lldp_neighbor_info", &[("local_interface", "Ethernet88")]),
            Some(1.0)
        );
        assert_eq!(snap.skipped_for(SkipReason::OverParentCap), 1);
        assert!(snap.truncated);
    }
}
