use crate::alignment::{AlignmentId, AlignmentInput, RunId, SubjectId};
use crate::lineage::{LineageType, ReconciliationRecord};
use crate::stage::{
    AncestryEstimate, CallableLociSummary, CoverageSummary, LineageCallOutput, ReadMetrics,
    SexCall, SkipReason, StageFailure, StageId, StageOutput, StageSkip, VariantCallSummary,
};
use serde::{Deserialize, Serialize};

/// What one pipeline run produced.
///
/// Every stage field is optional: a soft-failed stage leaves its field empty
/// and records the reason in `failures`; a stage skipped by policy is listed
/// in `skipped`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchResult {
    pub subject_id: SubjectId,
    pub run_id: RunId,
    pub alignment_id: AlignmentId,
    pub reference_path: Option<String>,
    pub read_metrics: Option<ReadMetrics>,
    pub coverage: Option<CoverageSummary>,
    pub callable_loci: Option<CallableLociSummary>,
    pub sex: Option<SexCall>,
    pub variants: Option<VariantCallSummary>,
    pub mt_lineage: Option<LineageCallOutput>,
    pub paternal_lineage: Option<LineageCallOutput>,
    pub ancestry: Option<AncestryEstimate>,
    pub failures: Vec<StageFailure>,
    pub skipped: Vec<StageSkip>,
    /// Stages answered from the checkpoint without invoking an executor.
    pub cached_stages: Vec<StageId>,
    pub executed_stages: Vec<StageId>,
    pub reconciliations: Vec<ReconciliationRecord>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome<'a> {
    Succeeded,
    Failed(&'a str),
    Skipped(&'a SkipReason),
    NotRun,
}

impl BatchResult {
    pub fn for_input(input: &AlignmentInput) -> Self {
        Self {
            subject_id: input.subject_id.clone(),
            run_id: input.run_id.clone(),
            alignment_id: input.alignment_id.clone(),
            ..Default::default()
        }
    }

    /// Stores a stage's output in its field, replacing any earlier value.
    pub fn absorb(&mut self, output: StageOutput) {
        match output {
            StageOutput::ReadMetrics(m) => self.read_metrics = Some(m),
            StageOutput::Coverage(c) => self.coverage = Some(c),
            StageOutput::CallableLoci(c) => self.callable_loci = Some(c),
            StageOutput::SexInference(s) => self.sex = Some(s),
            StageOutput::VariantCalling(v) => self.variants = Some(v),
            StageOutput::MtLineage(l) => self.mt_lineage = Some(l),
            StageOutput::PaternalLineage(l) => self.paternal_lineage = Some(l),
            StageOutput::Ancestry(a) => self.ancestry = Some(a),
        }
    }

    pub fn failure_for(&self, stage: StageId) -> Option<&str> {
        self.failures
            .iter()
            .find(|f| f.stage == stage)
            .map(|f| f.reason.as_str())
    }

    pub fn skip_for(&self, stage: StageId) -> Option<&SkipReason> {
        self.skipped
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| &s.reason)
    }

    pub fn lineage(&self, lineage_type: LineageType) -> Option<&LineageCallOutput> {
        match lineage_type {
            LineageType::Maternal => self.mt_lineage.as_ref(),
            LineageType::Paternal => self.paternal_lineage.as_ref(),
        }
    }

    pub fn reconciliation(&self, lineage_type: LineageType) -> Option<&ReconciliationRecord> {
        self.reconciliations
            .iter()
            .find(|r| r.lineage_type == lineage_type)
    }

    fn has_output(&self, stage: StageId) -> bool {
        match stage {
            StageId::ReadMetrics => self.read_metrics.is_some(),
            StageId::Coverage => self.coverage.is_some(),
            StageId::CallableLoci => self.callable_loci.is_some(),
            StageId::SexInference => self.sex.is_some(),
            StageId::VariantCalling => self.variants.is_some(),
            StageId::MtLineage => self.mt_lineage.is_some(),
            StageId::PaternalLineage => self.paternal_lineage.is_some(),
            StageId::Ancestry => self.ancestry.is_some(),
        }
    }

    /// Distinguishes skipped-by-policy, attempted-and-failed and succeeded.
    pub fn outcome_of(&self, stage: StageId) -> StageOutcome<'_> {
        if let Some(reason) = self.skip_for(stage) {
            return StageOutcome::Skipped(reason);
        }
        if let Some(reason) = self.failure_for(stage) {
            return StageOutcome::Failed(reason);
        }
        if self.has_output(stage) {
            StageOutcome::Succeeded
        } else {
            StageOutcome::NotRun
        }
    }

    pub fn is_fully_successful(&self) -> bool {
        self.failures.is_empty()
    }
}
