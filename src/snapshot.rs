//! Alignment, run and subject metadata threaded through the stage loop.
//!
//! Each transition returns the next snapshot and leaves the previous one
//! intact; a stage only changes the records it is responsible for.

use crate::records::PipelineRecord;
use haplocall_protocol::{
    AlignmentInput, AlignmentMetrics, RunMetrics, StageId, StageOutput, SubjectProfile,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSnapshot {
    pub alignment: AlignmentMetrics,
    pub run: RunMetrics,
    pub subject: SubjectProfile,
}

impl PipelineSnapshot {
    pub fn new(input: &AlignmentInput) -> Self {
        Self {
            alignment: AlignmentMetrics {
                subject_id: input.subject_id.clone(),
                run_id: input.run_id.clone(),
                alignment_id: input.alignment_id.clone(),
                ..Default::default()
            },
            run: RunMetrics {
                subject_id: input.subject_id.clone(),
                run_id: input.run_id.clone(),
                technology: input.technology,
                read_length: None,
                total_reads: None,
                mean_insert_size: None,
            },
            subject: SubjectProfile {
                subject_id: input.subject_id.clone(),
                sex: None,
            },
        }
    }

    /// The snapshot after `output`; `self` is left untouched.
    pub fn apply(&self, output: &StageOutput) -> Self {
        let Self {
            mut alignment,
            mut run,
            mut subject,
        } = self.clone();
        match output {
            StageOutput::ReadMetrics(m) => {
                alignment.total_reads = Some(m.total_reads);
                alignment.mapped_reads = Some(m.mapped_reads);
                run.read_length = Some(m.read_length);
                run.total_reads = Some(m.total_reads);
                run.mean_insert_size = m.mean_insert_size;
            }
            StageOutput::Coverage(c) => {
                alignment.mean_depth = Some(c.mean_depth);
                alignment.median_depth = Some(c.median_depth);
                alignment.fraction_at_10x = Some(c.fraction_at_10x);
            }
            StageOutput::CallableLoci(c) => {
                alignment.callable_bases = Some(c.callable_bases);
                alignment.callable_fraction = Some(c.callable_fraction());
            }
            StageOutput::SexInference(call) => subject.sex = Some(call.clone()),
            StageOutput::VariantCalling(v) => alignment.variant_count = Some(v.variant_count),
            StageOutput::MtLineage(_)
            | StageOutput::PaternalLineage(_)
            | StageOutput::Ancestry(_) => {}
        }
        Self {
            alignment,
            run,
            subject,
        }
    }

    /// Records a completed `stage` rewrites at the persistence boundary.
    pub fn records_for(&self, stage: StageId) -> Vec<PipelineRecord> {
        match stage {
            StageId::ReadMetrics => vec![
                PipelineRecord::AlignmentMetrics(self.alignment.clone()),
                PipelineRecord::RunMetrics(self.run.clone()),
            ],
            StageId::Coverage | StageId::CallableLoci | StageId::VariantCalling => {
                vec![PipelineRecord::AlignmentMetrics(self.alignment.clone())]
            }
            StageId::SexInference => vec![PipelineRecord::SubjectProfile(self.subject.clone())],
            StageId::MtLineage | StageId::PaternalLineage | StageId::Ancestry => vec![],
        }
    }
}

/// Stages whose outputs fill the fields of `record`.
pub fn record_sources(record: &PipelineRecord) -> &'static [StageId] {
    match record {
        PipelineRecord::AlignmentMetrics(_) => &[
            StageId::ReadMetrics,
            StageId::Coverage,
            StageId::CallableLoci,
            StageId::VariantCalling,
        ],
        PipelineRecord::RunMetrics(_) => &[StageId::ReadMetrics],
        PipelineRecord::SubjectProfile(_) => &[StageId::SexInference],
        PipelineRecord::Checkpoint(_) | PipelineRecord::Reconciliation(_) => &[],
    }
}
