//! VLAN domain: configured and operational VLANs joined with their members.

use async_trait::async_trait;

use crate::cache::CyclePhase;
use crate::error::ExporterResult;
use crate::fields::{field, first_non_empty, status_to_gauge};
use crate::pipeline::{
    extract_membership, EntitySource, Extraction, MemberSource, MembershipPlan, Pipeline, ScrapeContext,
};
use crate::store::Database;
use crate::types::{DescriptorTable, MetricDescriptor};
use crate::{METRIC_NAMESPACE, UNKNOWN_LABEL};

const SUBSYSTEM: &str = "vlan";

const PARENTS: &[EntitySource] = &[
    EntitySource { db: Database::ConfigDb, prefix: "VLAN|" },
    EntitySource { db: Database::ApplDb, prefix: "VLAN_TABLE:" },
];

const PLAN: MembershipPlan = MembershipPlan {
    parents: PARENTS,
    members: MemberSource { db: Database::ConfigDb, prefix: "VLAN_MEMBER|", separator: '|' },
};

const CONFIG: usize = 0;
const APPL: usize = 1;

#[derive(Debug)]
pub struct VlanPipeline {
    table: DescriptorTable,
    info: MetricDescriptor,
    admin_status: MetricDescriptor,
    oper_status: MetricDescriptor,
    member_info: MetricDescriptor,
    members: MetricDescriptor,
    members_discovered: MetricDescriptor,
}

impl VlanPipeline {
    pub fn new() -> Self {
        let gauge = |name: &str, help: &str, labels: &[&'static str]| {
            MetricDescriptor::gauge(METRIC_NAMESPACE, SUBSYSTEM, name, help, labels)
        };

        let info = gauge("info", "Non-numeric data about VLAN, value is always 1", &["vlan", "vlan_id"]);
        let admin_status = gauge("admin_status", "Administrative state of VLAN (1=up, 0=down)", &["vlan"]);
        let oper_status = gauge("oper_status", "Operational state of VLAN (1=up, 0=down)", &["vlan"]);
        let member_info = gauge(
            "member_info",
            "Non-numeric data about VLAN member, value is always 1",
            &["vlan", "member", "tagging_mode"],
        );
        let members = gauge("members", "Number of VLAN members exported", &["vlan"]);
        let members_discovered = gauge(
            "members_discovered",
            "Number of VLAN members found in the source, before bounding",
            &["vlan"],
        );

        let mut table = DescriptorTable::new();
        table.extend([
            info.clone(),
            admin_status.clone(),
            oper_status.clone(),
            member_info.clone(),
            members.clone(),
            members_discovered.clone(),
        ]);

        Self {
            table,
            info,
            admin_status,
            oper_status,
            member_info,
            members,
            members_discovered,
        }
    }
}

impl Default for VlanPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for VlanPipeline {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn title(&self) -> &'static str {
        "VLAN"
    }

    fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    async fn extract(&self, ctx: &ScrapeContext) -> ExporterResult<Extraction> {
        let membership = extract_membership(ctx, &PLAN).await?;

        ctx.enter(CyclePhase::Emitting);
        let mut records = Vec::new();
        for vlan in &membership.entities {
            let config = vlan.table(CONFIG);
            let appl = vlan.table(APPL);
            let name = vlan.id.as_str();

            let vlan_id = first_non_empty([field(config, "vlanid"), name.strip_prefix("Vlan").unwrap_or(name)])
                .unwrap_or("")
                .trim();
            records.push(self.info.sample(1.0, &[name, vlan_id]));

            if let Some(admin) = first_non_empty([field(appl, "admin_status"), field(config, "admin_status")]) {
                records.push(self.admin_status.sample(status_to_gauge(admin), &[name]));
            }
            if let Some(oper) = first_non_empty([field(appl, "oper_status")]) {
                records.push(self.oper_status.sample(status_to_gauge(oper), &[name]));
            }

            for member in &vlan.members {
                let mode = first_non_empty([field(&member.fields, "tagging_mode")])
                    .map(str::trim)
                    .unwrap_or(UNKNOWN_LABEL);
                records.push(self.member_info.sample(1.0, &[name, &member.id, mode]));
            }

            records.push(self.members.sample(vlan.members.len() as f64, &[name]));
            records.push(self.members_discovered.sample(vlan.members_total as f64, &[name]));
        }

        Ok(Extraction {
            records,
            ledger: membership.ledger,
            truncated: membership.truncated,
            source_updated_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PhaseTracker;
    use crate::config::DomainConfig;
    use crate::error::SkipReason;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_hash(Database::ConfigDb, "VLAN|Vlan1000", [("vlanid", "1000"), ("admin_status", "up")])
            .with_hash(Database::ConfigDb, "VLAN|Vlan2000", [("admin_status", "down")])
            .with_hash(Database::ApplDb, "VLAN_TABLE:Vlan1000", [("oper_status", "up")])
            .with_hash(Database::ApplDb, "VLAN_TABLE:Vlan3000", [("admin_status", "UP")])
            .with_hash(Database::ConfigDb, "VLAN_MEMBER|Vlan1000|PortChannel1", [("tagging_mode", "tagged")])
            .with_hash(Database::ConfigDb, "VLAN_MEMBER|Vlan1000|Ethernet0", [("tagging_mode", "untagged")])
            .with_hash(Database::ConfigDb, "VLAN_MEMBER|Vlan3000|Ethernet4", Vec::<(&str, &str)>::new())
    }

    async fn run(store: MemoryStore, config: DomainConfig) -> Extraction {
        let ctx = ScrapeContext::new("vlan", Arc::new(store), &config, PhaseTracker::detached("vlan"));
        VlanPipeline::new().extract(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_vlan_records() {
        let out = run(store(), DomainConfig::default()).await.into_snapshot();

        assert_eq!(out.value("sonic_vlan_info", &[("vlan", "Vlan1000"), ("vlan_id", "1000")]), Some(1.0));
        // vlan id falls back to the name suffix
        assert_eq!(out.value("sonic_vlan_info", &[("vlan", "Vlan3000"), ("vlan_id", "3000")]), Some(1.0));
        assert_eq!(out.value("sonic_vlan_admin_status", &[("vlan", "Vlan2000")]), Some(0.0));
        assert_eq!(out.value("sonic_vlan_admin_status", &[("vlan", "Vlan3000")]), Some(1.0));
        assert_eq!(out.value("sonic_vlan_oper_status", &[("vlan", "Vlan1000")]), Some(1.0));
        assert_eq!(out.value("sonic_vlan_oper_status", &[("vlan", "Vlan2000")]), None);
        assert_eq!(out.value("sonic_vlan_members", &[("vlan", "Vlan1000")]), Some(2.0));
        assert_eq!(out.value("sonic_vlan_members", &[("vlan", "Vlan2000")]), Some(0.0));
        assert_eq!(
            out.value(
                "sonic_vlan_member_info",
                &[("vlan", "Vlan3000"), ("member", "Ethernet4"), ("tagging_mode", "unknown")]
            ),
            Some(1.0)
        );

        let members: Vec<&str> = out
            .find("sonic_vlan_member_info")
            .filter(|r| r.label("vlan") == Some("Vlan1000"))
            .filter_map(|r| r.label("member"))
            .collect();
        assert_eq!(members, vec!["Ethernet0", "PortChannel1"]);
        assert_eq!(out.skipped, 0);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_member_cap_keeps_true_total() {
        let out = run(store(), DomainConfig::default().with_caps(10, 1)).await;
        assert!(out.ledger.is_balanced());
        let snap = out.into_snapshot();

        assert_eq!(snap.value("sonic_vlan_members", &[("vlan", "Vlan1000")]), Some(1.0));
        assert_eq!(snap.value("sonic_vlan_members_discovered", &[("vlan", "Vlan1000")]), Some(2.0));
        assert_eq!(snap.skipped_for(SkipReason::OverChildCap), 1);
        assert!(snap.truncated);
    }
}
