use crate::alignment::{RunId, SubjectId, TechnologyTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageType {
    Paternal,
    Maternal,
}

impl LineageType {
    pub const ALL: [LineageType; 2] = [LineageType::Paternal, LineageType::Maternal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paternal => "paternal",
            Self::Maternal => "maternal",
        }
    }
}

impl fmt::Display for LineageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run's lineage determination. Never mutated; a newer call from the
/// same run supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLineageCall {
    pub subject_id: SubjectId,
    pub source_run: RunId,
    pub lineage_type: LineageType,
    pub label: String,
    pub confidence: f64,
    pub tier: TechnologyTier,
    pub supporting_variants: u32,
    pub conflicting_variants: u32,
    pub called_at_unix_ms: u128,
}

/// Severity-ordered: later variants are worse.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    #[default]
    Compatible,
    MinorDivergence,
    MajorDivergence,
    Incompatible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusCall {
    pub label: String,
    pub confidence: f64,
    pub tier: TechnologyTier,
    pub source_run: RunId,
    /// Live calls whose label equals the consensus label or lies on its path.
    pub agreeing_calls: usize,
    pub total_calls: usize,
}

/// A pair of calls whose labels are not on one ancestral path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallConflict {
    pub first_run: RunId,
    pub first_label: String,
    pub second_run: RunId,
    pub second_label: String,
    pub compatibility: Compatibility,
    #[serde(default)]
    pub branch_distance: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub subject_id: SubjectId,
    pub lineage_type: LineageType,
    /// At most one live call per source run.
    pub calls: BTreeMap<RunId, RunLineageCall>,
    #[serde(default)]
    pub consensus: Option<ConsensusCall>,
    #[serde(default)]
    pub compatibility: Compatibility,
    #[serde(default)]
    pub conflicts: Vec<CallConflict>,
    #[serde(default)]
    pub revision: u64,
}

impl ReconciliationRecord {
    pub fn new(subject_id: impl Into<String>, lineage_type: LineageType) -> Self {
        Self {
            subject_id: subject_id.into(),
            lineage_type,
            calls: BTreeMap::new(),
            consensus: None,
            compatibility: Compatibility::Compatible,
            conflicts: vec![],
            revision: 0,
        }
    }

    pub fn call_for(&self, run_id: &str) -> Option<&RunLineageCall> {
        self.calls.get(run_id)
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Whether the disagreement between runs warrants manual review.
    pub fn needs_review(&self) -> bool {
        self.compatibility >= Compatibility::MajorDivergence
    }
}
