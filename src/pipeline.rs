// ============================================================================
// SECTION 15: SOURCE EXTRACTION PIPELINE
// ============================================================================
// Shared shape of every domain pipeline:
// - Scan each namespace under the cycle deadline
// - Strip prefixes, union identifiers, group children by parent
// - Bound parents and children, fetch fields only for what is emitted
// - Hand records plus the skip ledger back to the cache
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use crate::accounting::SkipLedger;
use crate::cache::{CyclePhase, PhaseTracker, Snapshot};
use crate::config::DomainConfig;
use crate::error::{ExporterResult, SkipReason, SourceResult};
use crate::fields::{split_member_key, strip_identifier};
use crate::store::{Database, FieldMap, SourceStore};
use crate::types::{DescriptorTable, MetricRecord, Timestamp};

// ----------------------------------------------------------------------------
// 15.1 Scrape Context
// ----------------------------------------------------------------------------

/// Caps applied by one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_entities: usize,
    pub max_children: usize,
    pub scan_count: usize,
}

impl From<&DomainConfig> for Limits {
    fn from(config: &DomainConfig) -> Self {
        Self {
            max_entities: config.max_entities,
            max_children: config.max_children,
            scan_count: config.scan_count,
        }
    }
}

/// Everything one refresh cycle may touch. Built fresh per cycle.
pub struct ScrapeContext {
    pub domain: &'static str,
    pub limits: Limits,
    pub deadline: Instant,
    store: Arc<dyn SourceStore>,
    phase: PhaseTracker,
}

impl fmt::Debug for ScrapeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeContext")
            .field("domain", &self.domain)
            .field("limits", &self.limits)
            .field("store", &self.store.endpoint())
            .finish()
    }
}

impl ScrapeContext {
    pub fn new(
        domain: &'static str,
        store: Arc<dyn SourceStore>,
        config: &DomainConfig,
        phase: PhaseTracker,
    ) -> Self {
        Self {
            domain,
            limits: Limits::from(config),
            deadline: Instant::now() + config.timeout,
            store,
            phase,
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn enter(&self, phase: CyclePhase) {
        self.phase.enter(phase);
    }

    /// Keys under `prefix`, sorted and de-duplicated.
    pub async fn scan(&self, db: Database, prefix: &str) -> SourceResult<Vec<String>> {
        let pattern = format!("{}*", prefix);
        let mut keys = self
            .store
            .scan_keys(db, &pattern, self.limits.scan_count, self.deadline)
            .await?;
        keys.sort_unstable();
        keys.dedup();
        trace!(target: "sonic::engine", domain = self.domain, db = %db, prefix, keys = keys.len(), "Namespace scanned");
        Ok(keys)
    }

    pub async fn hget_all(&self, db: Database, key: &str) -> SourceResult<FieldMap> {
        self.store.hget_all(db, key, self.deadline).await
    }
}

// ----------------------------------------------------------------------------
// 15.2 Pipeline Trait
// ----------------------------------------------------------------------------

/// Output of one pipeline run, before the cache stamps it.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub records: Vec<MetricRecord>,
    pub ledger: SkipLedger,
    pub truncated: bool,
    pub source_updated_at: Option<Timestamp>,
}

impl Extraction {
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot::from_parts(
            self.records,
            self.ledger.skipped_by_reason(),
            self.truncated,
            self.source_updated_at,
        )
    }
}

/// Domain-specific scan, join and bound logic.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    /// Stable domain name, also the metric subsystem.
    fn name(&self) -> &'static str;

    /// Display name used in help text ("VLAN", "docker").
    fn title(&self) -> &'static str;

    /// Descriptors for every record this pipeline can emit.
    fn descriptors(&self) -> &DescriptorTable;

    /// Run one cycle against the store.
    async fn extract(&self, ctx: &ScrapeContext) -> ExporterResult<Extraction>;

    /// Records derived at collect time from the committed snapshot, such as
    /// ages that must not freeze between refreshes.
    fn collect_extras(&self, _snapshot: &Snapshot, _now: Timestamp) -> Vec<MetricRecord> {
        Vec::new()
    }
}

// ----------------------------------------------------------------------------
// 15.3 Namespace Scans
// ----------------------------------------------------------------------------

/// A namespace whose keys name top-level entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySource {
    pub db: Database,
    pub prefix: &'static str,
}

/// A namespace whose keys are `<prefix><parent><separator><child>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSource {
    pub db: Database,
    pub prefix: &'static str,
    pub separator: char,
}

/// Parents may come from several namespaces (configuration and operational
/// state); their identifiers are unioned.
#[derive(Debug, Clone, Copy)]
pub struct MembershipPlan {
    pub parents: &'static [EntitySource],
    pub members: MemberSource,
}

/// Scan `source` and strip its prefix, booking malformed keys on the stage
/// named after the prefix. Returns `(identifier, raw key)` pairs sorted by
/// identifier.
pub async fn scan_identifiers(
    ctx: &ScrapeContext,
    source: &EntitySource,
    ledger: &mut SkipLedger,
) -> SourceResult<Vec<(String, String)>> {
    let keys = ctx.scan(source.db, source.prefix).await?;
    ledger.seen(source.prefix, keys.len());

    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        match strip_identifier(&key, source.prefix) {
            Some(id) => {
                ledger.accept(source.prefix);
                out.push((id.to_string(), key.clone()));
            }
            None => ledger.skip(source.prefix, SkipReason::MalformedKey),
        }
    }
    out.sort();
    Ok(out)
}

// ----------------------------------------------------------------------------
// 15.4 Membership Extraction
// ----------------------------------------------------------------------------

/// Stage booking each distinct parent identifier.
pub const ENTITY_STAGE: &str = "entities";

/// One child of an emitted entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub fields: FieldMap,
}

/// One emitted entity with its per-namespace fields and bounded children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    /// One field map per parent namespace, in plan order; empty when the
    /// entity is absent from that namespace.
    pub tables: Vec<FieldMap>,
    /// Children in identifier order, at most `max_children`.
    pub members: Vec<Member>,
    /// Children discovered before bounding.
    pub members_total: usize,
}

impl Entity {
    pub fn table(&self, index: usize) -> &FieldMap {
        static EMPTY: FieldMap = FieldMap::new();
        self.tables.get(index).unwrap_or(&EMPTY)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Membership {
    pub entities: Vec<Entity>,
    pub ledger: SkipLedger,
    pub truncated: bool,
}

/// Scan, join and bound a parent/child domain.
pub async fn extract_membership(ctx: &ScrapeContext, plan: &MembershipPlan) -> ExporterResult<Membership> {
    let mut ledger = SkipLedger::new();

    // Scanning
    ctx.enter(CyclePhase::Scanning);
    let mut presence: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();
    for (index, source) in plan.parents.iter().enumerate() {
        for (id, key) in scan_identifiers(ctx, source, &mut ledger).await? {
            let slots = presence
                .entry(id)
                .or_insert_with(|| vec![None; plan.parents.len()]);
            slots[index] = Some(key);
        }
    }

    let member_keys = ctx.scan(plan.members.db, plan.members.prefix).await?;
    let member_stage = plan.members.prefix;
    ledger.seen(member_stage, member_keys.len());

    // Joining
    ctx.enter(CyclePhase::Joining);
    let mut children: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for key in &member_keys {
        match split_member_key(key, plan.members.prefix, plan.members.separator) {
            Some((parent, child)) => {
                children
                    .entry(parent.to_string())
                    .or_default()
                    .insert(child.to_string(), key.clone());
            }
            None => ledger.skip(member_stage, SkipReason::MalformedKey),
        }
    }

    // Bounding
    ctx.enter(CyclePhase::Bounding);
    ledger.seen(ENTITY_STAGE, presence.len());
    let max_entities = ctx.limits.max_entities;
    let max_children = ctx.limits.max_children;

    let mut kept: Vec<(String, Vec<Option<String>>, Vec<(String, String)>, usize)> = Vec::new();
    for (index, (id, slots)) in presence.into_iter().enumerate() {
        let group = children.remove(&id).unwrap_or_default();
        if index >= max_entities {
            ledger.skip(ENTITY_STAGE, SkipReason::OverParentCap);
            ledger.skip_n(member_stage, SkipReason::ParentSkipped, group.len());
            continue;
        }
        ledger.accept(ENTITY_STAGE);

        let total = group.len();
        let emitted: Vec<(String, String)> = group.into_iter().take(max_children).collect();
        ledger.accept_n(member_stage, emitted.len());
        ledger.skip_n(member_stage, SkipReason::OverChildCap, total - emitted.len());
        kept.push((id, slots, emitted, total));
    }

    // Children whose parent is in no parent namespace.
    let orphans: usize = children.values().map(BTreeMap::len).sum();
    ledger.skip_n(member_stage, SkipReason::ParentSkipped, orphans);

    let truncated = ledger.hit_capacity();

    // Fields are fetched only for what survives the bounds.
    let mut entities = Vec::with_capacity(kept.len());
    for (id, slots, emitted, members_total) in kept {
        let mut tables = Vec::with_capacity(slots.len());
        for (source, slot) in plan.parents.iter().zip(&slots) {
            tables.push(match slot {
                Some(key) => ctx.hget_all(source.db, key).await?,
                None => FieldMap::new(),
            });
        }

        let mut members = Vec::with_capacity(emitted.len());
        for (child, key) in emitted {
            let fields = ctx.hget_all(plan.members.db, &key).await?;
            members.push(Member { id: child, fields });
        }

        entities.push(Entity {
            id,
            tables,
            members,
            members_total,
        });
    }

    Ok(Membership {
        entities,
        ledger,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExporterError, SourceError};
    use crate::store::{MemoryStore, MockSourceStore};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const PARENTS: &[EntitySource] = &[
        EntitySource { db: Database::ConfigDb, prefix: "PARENT|" },
        EntitySource { db: Database::ApplDb, prefix: "PARENT_TABLE:" },
    ];

    const PLAN: MembershipPlan = MembershipPlan {
        parents: PARENTS,
        members: MemberSource { db: Database::ConfigDb, prefix: "CHILD|", separator: '|' },
    };

    fn ctx_for(store: Arc<dyn SourceStore>, max_entities: usize, max_children: usize) -> ScrapeContext {
        let config = DomainConfig::default().with_caps(max_entities, max_children);
        ScrapeContext::new("test", store, &config, PhaseTracker::detached("test"))
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[tokio::test]
    async fn test_parent_cap_keeps_lexicographic_first() {
        let store = MemoryStore::new()
            .with_hash(Database::ConfigDb, "PARENT|B", [("x", "1")])
            .with_hash(Database::ConfigDb, "PARENT|A", [("x", "1")]);
        let ctx = ctx_for(Arc::new(store), 1, 10);

        let out = extract_membership(&ctx, &PLAN).await.unwrap();
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.entities[0].id, "A");
        assert_eq!(out.ledger.total_skipped(), 1);
        assert!(out.truncated);
        assert!(out.ledger.is_balanced());
    }

    #[tokio::test]
    async fn test_union_and_children() {
        let store = MemoryStore::new()
            .with_hash(Database::ConfigDb, "PARENT|P1", [("cfg", "c")])
            .with_hash(Database::ApplDb, "PARENT_TABLE:P1", [("oper", "up")])
            .with_hash(Database::ApplDb, "PARENT_TABLE:P2", [("oper", "down")])
            .with_hash(Database::ConfigDb, "PARENT|", [("x", "bad")])
            .with_hash(Database::ConfigDb, "CHILD|P1|c2", [("mode", "tagged")])
            .with_hash(Database::ConfigDb, "CHILD|P1|c1", [("mode", "untagged")])
            .with_hash(Database::ConfigDb, "CHILD|P1|c3", [("mode", "tagged")])
            .with_hash(Database::ConfigDb, "CHILD|P9|c1", [("mode", "tagged")])
            .with_hash(Database::ConfigDb, "CHILD|broken", [("mode", "tagged")]);
        let ctx = ctx_for(Arc::new(store), 10, 2);

        let out = extract_membership(&ctx, &PLAN).await.unwrap();
        let ids: Vec<&str> = out.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P2"]);

        let p1 = &out.entities[0];
        assert_eq!(p1.table(0).get("cfg").map(String::as_str), Some("c"));
        assert_eq!(p1.table(1).get("oper").map(String::as_str), Some("up"));
        let members: Vec<&str> = p1.members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(members, vec!["c1", "c2"]);
        assert_eq!(p1.members_total, 3);

        let p2 = &out.entities[1];
        assert!(p2.table(0).is_empty());
        assert!(p2.members.is_empty());

        let by_reason = out.ledger.skipped_by_reason();
        assert_eq!(by_reason.get(&SkipReason::MalformedKey), Some(&2));
        assert_eq!(by_reason.get(&SkipReason::OverChildCap), Some(&1));
        assert_eq!(by_reason.get(&SkipReason::ParentSkipped), Some(&1));
        assert!(out.truncated);
        assert!(out.ledger.is_balanced(), "unbalanced: {:?}", out.ledger.unbalanced());
    }

    #[tokio::test]
    async fn test_fields_fetched_only_for_emitted() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store.insert(Database::ConfigDb, &format!("PARENT|P{}", i), [("x", "1")]);
        }
        let ctx = ctx_for(store.clone(), 2, 2);
        extract_membership(&ctx, &PLAN).await.unwrap();
        // three scans plus two parent fetches
        assert_eq!(store.call_count(), 5);
    }

    #[tokio::test]
    async fn test_source_failure_aborts_cycle() {
        let mut store = MockSourceStore::new();
        store
            .expect_scan_keys()
            .returning(|_, _, _, _| Err(SourceError::unavailable("mock://", "connection refused")));
        store.expect_endpoint().return_const("mock://".to_string());

        let ctx = ctx_for(Arc::new(store), 10, 10);
        let err = extract_membership(&ctx, &PLAN).await.unwrap_err();
        assert!(matches!(err, ExporterError::Source(SourceError::Unavailable { .. })));
    }

    proptest! {
        #[test]
        fn prop_membership_accounting_closes(
            parents in proptest::collection::btree_set("[a-e]{1,2}", 0..12),
            links in proptest::collection::vec(("[a-f]{1,2}", "[0-9]{1,2}"), 0..40),
            max_entities in 1usize..6,
            max_children in 1usize..4,
        ) {
            let store = MemoryStore::new();
            for p in &parents {
                store.insert(Database::ConfigDb, &format!("PARENT|{}", p), [("x", "1")]);
            }
            for (p, c) in &links {
                store.insert(Database::ConfigDb, &format!("CHILD|{}|{}", p, c), [("x", "1")]);
            }
            let ctx = ctx_for(Arc::new(store), max_entities, max_children);
            let out = block_on(extract_membership(&ctx, &PLAN)).unwrap();

            prop_assert!(out.ledger.is_balanced());
            prop_assert!(out.entities.len() <= max_entities);
            prop_assert!(out.entities.iter().all(|e| e.members.len() <= max_children));
            prop_assert_eq!(out.entities.len(), parents.len().min(max_entities));

            let emitted_members: usize = out.entities.iter().map(|e| e.members.len()).sum();
            let distinct_links: BTreeSet<_> = links.iter().collect();
            let members_tally = out.ledger.stage("CHILD|").cloned().unwrap_or_default();
            prop_assert_eq!(members_tally.seen as usize, distinct_links.len());
            prop_assert_eq!(members_tally.accepted as usize, emitted_members);

            let sorted: Vec<_> = out.entities.iter().map(|e| e.id.clone()).collect();
            let mut expected = sorted.clone();
            expected.sort();
            prop_assert_eq!(sorted, expected);
        }
    }
}
