//! Link aggregation domain: port channels and their member interfaces.

use async_trait::async_trait;

use crate::cache::CyclePhase;
use crate::error::ExporterResult;
use crate::fields::{field, first_non_empty, status_to_gauge};
use crate::pipeline::{
    extract_membership, EntitySource, Extraction, MemberSource, MembershipPlan, Pipeline, ScrapeContext,
};
use crate::store::Database;
use crate::types::{DescriptorTable, MetricDescriptor};
use crate::METRIC_NAMESPACE;

const SUBSYSTEM: &str = "lag";

const PARENTS: &[EntitySource] = &[
    EntitySource { db: Database::ConfigDb, prefix: "PORTCHANNEL|" },
    EntitySource { db: Database::ApplDb, prefix: "LAG_TABLE:" },
];

const PLAN: MembershipPlan = MembershipPlan {
    parents: PARENTS,
    members: MemberSource { db: Database::ApplDb, prefix: "LAG_MEMBER_TABLE:", separator: ':' },
};

#[derive(Debug)]
pub struct LagPipeline {
    table: DescriptorTable,
    info: MetricDescriptor,
    admin_status: MetricDescriptor,
    oper_status: MetricDescriptor,
    member_status: MetricDescriptor,
    members: MetricDescriptor,
    members_discovered: MetricDescriptor,
}

impl LagPipeline {
    pub fn new() -> Self {
        let gauge = |name: &str, help: &str, labels: &[&'static str]| {
            MetricDescriptor::gauge(METRIC_NAMESPACE, SUBSYSTEM, name, help, labels)
        };

        let info = gauge("info", "Non-numeric data about LAG, value is always 1", &["lag"]);
        let admin_status = gauge("admin_status", "Administrative state of LAG (1=up, 0=down)", &["lag"]);
        let oper_status = gauge("oper_status", "Operational state of LAG (1=up, 0=down)", &["lag"]);
        let member_status = gauge(
            "member_status",
            "Status of LAG member interface (1=enabled, 0=disabled)",
            &["lag", "member"],
        );
        let members = gauge("members", "Number of LAG member interfaces exported", &["lag"]);
        let members_discovered = gauge(
            "members_discovered",
            "Number of LAG member interfaces found in the source, before bounding",
            &["lag"],
        );

        let mut table = DescriptorTable::new();
        for d in [&info, &admin_status, &oper_status, &member_status, &members, &members_discovered] {
            table.push(d.clone());
        }

        Self {
            table,
            info,
            admin_status,
            oper_status,
            member_status,
            members,
            members_discovered,
        }
    }
}

impl Default for LagPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pipeline for LagPipeline {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn title(&self) -> &'static str {
        "LAG"
    }

    fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    async fn extract(&self, ctx: &ScrapeContext) -> ExporterResult<Extraction> {
        let membership = extract_membership(ctx, &PLAN).await?;

        ctx.enter(CyclePhase::Emitting);
        let mut records = Vec::with_capacity(membership.entities.len() * 6);
        for lag in &membership.entities {
            let (config, appl) = (lag.table(0), lag.table(1));
            let name = lag.id.as_str();

            records.push(self.info.sample(1.0, &[name]));
            if let Some(admin) = first_non_empty([field(appl, "admin_status"), field(config, "admin_status")]) {
                records.push(self.admin_status.sample(status_to_gauge(admin), &[name]));
            }
            if let Some(oper) = first_non_empty([field(appl, "oper_status")]) {
                records.push(self.oper_status.sample(status_to_gauge(oper), &[name]));
            }

            for member in &lag.members {
                let status = status_to_gauge(field(&member.fields, "status"));
                records.push(self.member_status.sample(status, &[name, &member.id]));
            }

            records.push(self.members.sample(lag.members.len() as f64, &[name]));
            records.push(self.members_discovered.sample(lag.members_total as f64, &[name]));
        }

        Ok(Extraction {
            records,
            ledger: membership.ledger,
            truncated: membership.truncated,
            source_updated_at: None,
        })
    }
}
