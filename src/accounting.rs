// ============================================================================
// SECTION 12: BOUNDED OUTPUT ACCOUNTING
// ============================================================================
// Double-entry bookkeeping for every pipeline stage. Each input record seen by
// a stage is booked exactly once, either as accepted (it flows on to a metric
// record or to the next stage) or as skipped with a reason.
// ============================================================================

use std::collections::BTreeMap;

use crate::error::SkipReason;

/// Tally for one stage of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTally {
    pub seen: u64,
    pub accepted: u64,
    pub skipped: BTreeMap<SkipReason, u64>,
}

impl StageTally {
    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> u64 {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    /// `accepted + skipped == seen`
    pub fn is_balanced(&self) -> bool {
        self.accepted + self.skipped_total() == self.seen
    }
}

/// Pipeline-local skip ledger, threaded through one refresh cycle and folded
/// into the snapshot on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipLedger {
    stages: BTreeMap<&'static str, StageTally>,
}

impl SkipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn tally(&mut self, stage: &'static str) -> &mut StageTally {
        self.stages.entry(stage).or_default()
    }

    /// Book `n` inputs arriving at `stage`.
    pub fn seen(&mut self, stage: &'static str, n: usize) {
        self.tally(stage).seen += n as u64;
    }

    pub fn accept(&mut self, stage: &'static str) {
        self.accept_n(stage, 1);
    }

    pub fn accept_n(&mut self, stage: &'static str, n: usize) {
        self.tally(stage).accepted += n as u64;
    }

    pub fn skip(&mut self, stage: &'static str, reason: SkipReason) {
        self.skip_n(stage, reason, 1);
    }

    pub fn skip_n(&mut self, stage: &'static str, reason: SkipReason, n: usize) {
        if n == 0 {
            return;
        }
        *self.tally(stage).skipped.entry(reason).or_insert(0) += n as u64;
    }

    pub fn stage(&self, stage: &str) -> Option<&StageTally> {
        self.stages.get(stage)
    }

    pub fn stages(&self) -> impl Iterator<Item = (&'static str, &StageTally)> + '_ {
        self.stages.iter().map(|(name, tally)| (*name, tally))
    }

    pub fn total_skipped(&self) -> u64 {
        self.stages.values().map(StageTally::skipped_total).sum()
    }

    pub fn skipped_by_reason(&self) -> BTreeMap<SkipReason, u64> {
        let mut out = BTreeMap::new();
        for tally in self.stages.values() {
            for (reason, n) in &tally.skipped {
                *out.entry(*reason).or_insert(0) += n;
            }
        }
        out
    }

    /// Whether any bound produced a skip this cycle.
    pub fn hit_capacity(&self) -> bool {
        self.stages
            .values()
            .flat_map(|t| t.skipped.keys())
            .any(SkipReason::is_over_capacity)
    }

    pub fn is_balanced(&self) -> bool {
        self.stages.values().all(StageTally::is_balanced)
    }

    /// Stages whose books do not close.
    pub fn unbalanced(&self) -> Vec<&'static str> {
        self.stages
            .iter()
            .filter(|(_, t)| !t.is_balanced())
            .map(|(name, _)| *name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_stage_balances() {
        let mut ledger = SkipLedger::new();
        ledger.seen("keys", 4);
        ledger.accept_n("keys", 2);
        ledger.skip("keys", SkipReason::MalformedKey);
        assert!(!ledger.is_balanced());
        assert_eq!(ledger.unbalanced(), vec!["keys"]);

        ledger.skip("keys", SkipReason::OverParentCap);
        assert!(ledger.is_balanced());
        assert_eq!(ledger.total_skipped(), 2);
        assert!(ledger.hit_capacity());
    }

    #[test]
    fn test_skipped_by_reason_merges_stages() {
        let mut ledger = SkipLedger::new();
        ledger.seen("a", 2);
        ledger.skip_n("a", SkipReason::MissingRequiredField, 2);
        ledger.seen("b", 3);
        ledger.skip("b", SkipReason::MissingRequiredField);
        ledger.skip_n("b", SkipReason::Filtered, 0);
        ledger.accept_n("b", 2);

        let by_reason = ledger.skipped_by_reason();
        assert_eq!(by_reason.get(&SkipReason::MissingRequiredField), Some(&3));
        assert_eq!(by_reason.get(&SkipReason::Filtered), None);
        assert!(!ledger.hit_capacity());
        assert_eq!(ledger.stage("b").map(|t| t.skipped_for(SkipReason::MissingRequiredField)), Some(1));
    }

    proptest! {
        #[test]
        fn prop_any_partition_of_inputs_balances(accepted in 0usize..500, skips in proptest::collection::vec(0usize..50, 8)) {
            let mut ledger = SkipLedger::new();
            let total = accepted + skips.iter().sum::<usize>();
            ledger.seen("stage", total);
            ledger.accept_n("stage", accepted);
            for (reason, n) in SkipReason::ALL.iter().zip(skips.iter()) {
                ledger.skip_n("stage", *reason, *n);
            }
            prop_assert!(ledger.is_balanced());
            prop_assert_eq!(ledger.total_skipped() as usize, total - accepted);
        }
    }
}
