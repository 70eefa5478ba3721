//! Multi-run lineage consensus.
//!
//! Every operation takes a record and returns the next record; nothing is
//! mutated in place, so a rejected call leaves the caller's record as it was.

use crate::error::ConsensusInputError;
use crate::lineage_tree::{LabelRelation, LineageTreeComparator};
use haplocall_protocol::{
    CallConflict, Compatibility, ConsensusCall, ReconciliationRecord, RunLineageCall,
};
use itertools::Itertools;
use std::cmp::{Ordering, Reverse};
use std::sync::Arc;
use tracing::debug;

/// Total order used to pick the consensus call; the greatest call wins.
///
/// Technology tier dominates, then confidence, then evidence counts. The
/// source run id breaks any remaining tie so the winner never depends on
/// iteration order.
pub fn call_rank(a: &RunLineageCall, b: &RunLineageCall) -> Ordering {
    a.tier
        .cmp(&b.tier)
        .then_with(|| a.confidence.total_cmp(&b.confidence))
        .then_with(|| a.supporting_variants.cmp(&b.supporting_variants))
        .then_with(|| Reverse(a.conflicting_variants).cmp(&Reverse(b.conflicting_variants)))
        .then_with(|| Reverse(&a.source_run).cmp(&Reverse(&b.source_run)))
}

pub fn best_call<'a, I>(calls: I) -> Option<&'a RunLineageCall>
where
    I: IntoIterator<Item = &'a RunLineageCall>,
{
    calls.into_iter().max_by(|a, b| call_rank(a, b))
}

#[derive(Clone)]
pub struct ConsensusEngine {
    comparator: Arc<dyn LineageTreeComparator>,
    minor_divergence_max_branches: u32,
}

impl ConsensusEngine {
    pub fn new(comparator: Arc<dyn LineageTreeComparator>, minor_divergence_max_branches: u32) -> Self {
        Self {
            comparator,
            minor_divergence_max_branches,
        }
    }

    pub fn validate(
        record: &ReconciliationRecord,
        call: &RunLineageCall,
    ) -> Result<(), ConsensusInputError> {
        if call.source_run.trim().is_empty() {
            return Err(ConsensusInputError::MissingSourceRun);
        }
        if call.label.trim().is_empty() {
            return Err(ConsensusInputError::EmptyLabel {
                run: call.source_run.clone(),
            });
        }
        if !(0.0..=1.0).contains(&call.confidence) {
            return Err(ConsensusInputError::ConfidenceOutOfRange {
                run: call.source_run.clone(),
                confidence: call.confidence,
            });
        }
        if call.lineage_type != record.lineage_type {
            return Err(ConsensusInputError::LineageTypeMismatch {
                expected: record.lineage_type,
                actual: call.lineage_type,
            });
        }
        if call.subject_id != record.subject_id {
            return Err(ConsensusInputError::SubjectMismatch {
                expected: record.subject_id.clone(),
                actual: call.subject_id.clone(),
            });
        }
        Ok(())
    }

    /// Adds `call`, replacing any earlier call from the same run.
    pub fn add_call(
        &self,
        record: &ReconciliationRecord,
        call: RunLineageCall,
    ) -> Result<ReconciliationRecord, ConsensusInputError> {
        Self::validate(record, &call)?;
        let mut next = record.clone();
        if let Some(previous) = next.calls.insert(call.source_run.clone(), call) {
            debug!(run = %previous.source_run, "superseding earlier lineage call");
        }
        next.revision += 1;
        Ok(self.recompute(&next))
    }

    /// Removing a run that has no call returns the record unchanged.
    pub fn remove_call(&self, record: &ReconciliationRecord, source_run: &str) -> ReconciliationRecord {
        if !record.calls.contains_key(source_run) {
            return record.clone();
        }
        let mut next = record.clone();
        next.calls.remove(source_run);
        next.revision += 1;
        self.recompute(&next)
    }

    /// Derives consensus, compatibility and conflicts from the call set alone.
    pub fn recompute(&self, record: &ReconciliationRecord) -> ReconciliationRecord {
        let mut next = record.clone();
        let lineage_type = record.lineage_type;

        next.consensus = best_call(record.calls.values()).map(|best| {
            let agreeing_calls = record
                .calls
                .values()
                .filter(|c| {
                    self.comparator
                        .relate(lineage_type, &c.label, &best.label)
                        .on_one_path()
                })
                .count();
            ConsensusCall {
                label: best.label.clone(),
                confidence: best.confidence,
                tier: best.tier,
                source_run: best.source_run.clone(),
                agreeing_calls,
                total_calls: record.calls.len(),
            }
        });

        next.conflicts = record
            .calls
            .values()
            .tuple_combinations()
            .filter_map(|(a, b)| {
                let relation = self.comparator.relate(lineage_type, &a.label, &b.label);
                let (compatibility, branch_distance) = self.classify(relation)?;
                Some(CallConflict {
                    first_run: a.source_run.clone(),
                    first_label: a.label.clone(),
                    second_run: b.source_run.clone(),
                    second_label: b.label.clone(),
                    compatibility,
                    branch_distance,
                })
            })
            .collect();
        next.compatibility = next
            .conflicts
            .iter()
            .map(|c| c.compatibility)
            .max()
            .unwrap_or(Compatibility::Compatible);
        next
    }

    /// `None` when the pair agrees.
    fn classify(&self, relation: LabelRelation) -> Option<(Compatibility, Option<u32>)> {
        match relation {
            LabelRelation::Same | LabelRelation::Ancestor | LabelRelation::Descendant => None,
            LabelRelation::Diverged { branch_distance }
                if branch_distance <= self.minor_divergence_max_branches =>
            {
                Some((Compatibility::MinorDivergence, Some(branch_distance)))
            }
            LabelRelation::Diverged { branch_distance } => {
                Some((Compatibility::MajorDivergence, Some(branch_distance)))
            }
            LabelRelation::Incompatible => Some((Compatibility::Incompatible, None)),
        }
    }
}
