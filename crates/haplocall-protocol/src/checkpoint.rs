use crate::alignment::{AlignmentId, RunId, SubjectId};
use crate::now_unix_ms;
use crate::stage::{SexCall, StageDisposition, StageId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Content-derived identity of an alignment file.
///
/// The algorithm tag takes part in equality, so changing the fingerprint
/// mode invalidates every checkpoint written under the old mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub algorithm: String,
    pub size_bytes: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMark {
    pub disposition: StageDisposition,
    pub recorded_at_unix_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub subject_id: SubjectId,
    pub run_id: RunId,
    pub alignment_id: AlignmentId,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageMark>,
    #[serde(default)]
    pub read_length_estimate: Option<u32>,
    #[serde(default)]
    pub sex: Option<SexCall>,
    pub created_at_unix_ms: u128,
    pub updated_at_unix_ms: u128,
}

impl Checkpoint {
    pub fn fresh(
        subject_id: &str,
        run_id: &str,
        alignment_id: &str,
        fingerprint: Fingerprint,
    ) -> Self {
        let now = now_unix_ms();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            subject_id: subject_id.to_string(),
            run_id: run_id.to_string(),
            alignment_id: alignment_id.to_string(),
            fingerprint,
            stages: BTreeMap::new(),
            read_length_estimate: None,
            sex: None,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        }
    }

    pub fn mark(&self, stage: StageId) -> Option<&StageMark> {
        self.stages.get(&stage)
    }

    /// Completed, soft-failed and skipped stages are all done.
    pub fn is_done(&self, stage: StageId) -> bool {
        self.stages.contains_key(&stage)
    }

    pub fn is_skipped(&self, stage: StageId) -> bool {
        matches!(
            self.mark(stage).map(|m| &m.disposition),
            Some(StageDisposition::Skipped { .. })
        )
    }

    pub fn done_stages(&self) -> Vec<StageId> {
        self.stages.keys().copied().collect()
    }

    pub fn is_finished(&self) -> bool {
        StageId::ALL.iter().all(|stage| self.is_done(*stage))
    }

    pub fn with_read_length(mut self, read_length: u32) -> Self {
        self.read_length_estimate = Some(read_length);
        self
    }

    pub fn with_sex(mut self, sex: SexCall) -> Self {
        self.sex = Some(sex);
        self
    }

    pub fn same_alignment(&self, subject_id: &str, run_id: &str, alignment_id: &str) -> bool {
        self.subject_id == subject_id && self.run_id == run_id && self.alignment_id == alignment_id
    }
}
