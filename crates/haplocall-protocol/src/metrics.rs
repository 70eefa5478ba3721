//! Per-alignment, per-run and per-subject records the pipeline derives.
//!
//! Each record replaces its predecessor wholesale at the persistence
//! boundary; fields a stage did not produce stay `None`.

use crate::alignment::{AlignmentId, RunId, SubjectId, TechnologyTier};
use crate::stage::SexCall;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentMetrics {
    pub subject_id: SubjectId,
    pub run_id: RunId,
    pub alignment_id: AlignmentId,
    pub total_reads: Option<u64>,
    pub mapped_reads: Option<u64>,
    pub mean_depth: Option<f64>,
    pub median_depth: Option<f64>,
    pub fraction_at_10x: Option<f64>,
    pub callable_bases: Option<u64>,
    pub callable_fraction: Option<f64>,
    pub variant_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub subject_id: SubjectId,
    pub run_id: RunId,
    pub technology: TechnologyTier,
    #[serde(default)]
    pub read_length: Option<u32>,
    #[serde(default)]
    pub total_reads: Option<u64>,
    #[serde(default)]
    pub mean_insert_size: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub subject_id: SubjectId,
    #[serde(default)]
    pub sex: Option<SexCall>,
}
